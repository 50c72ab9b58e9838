//! Client-side job handle.

use crate::client::ResponseRouter;
use crate::codec::{DecodedResponse, Item, Params};
use crate::error::{TanukiError, TanukiResult};
use crate::letter::Status;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle for one dispatched job. Created when a request is published;
/// consumed by the blocking wait and never reused.
pub struct TanukiJob {
    job_id: String,
    status: Status,
    rx: mpsc::UnboundedReceiver<DecodedResponse>,
    router: Arc<ResponseRouter>,
}

impl std::fmt::Debug for TanukiJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TanukiJob")
            .field("job_id", &self.job_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TanukiJob {
    pub(crate) fn new(
        job_id: String,
        rx: mpsc::UnboundedReceiver<DecodedResponse>,
        router: Arc<ResponseRouter>,
    ) -> Self {
        Self {
            job_id,
            status: Status::Requested,
            rx,
            router,
        }
    }

    /// The correlation token this handle waits on.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Last observed status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Block until a terminal response for this job arrives. Intermediate
    /// progress deliveries are consumed and discarded. On `Error` the
    /// worker's failure description is surfaced as [`TanukiError::Remote`];
    /// on `Done` the full decoded outcome is returned.
    pub async fn wait(mut self) -> TanukiResult<JobOutcome> {
        loop {
            let response = self.rx.recv().await.ok_or_else(|| {
                TanukiError::Protocol(format!(
                    "delivery queue for job '{}' closed before a terminal response",
                    self.job_id
                ))
            })?;
            self.status = response.status;

            if !response.status.is_terminal() {
                continue;
            }

            // The correlation entry is removed when `self` drops.
            return match response.status {
                Status::Error => Err(TanukiError::Remote {
                    msg: remote_error_message(&response),
                }),
                _ => Ok(JobOutcome {
                    result: response.result,
                    request_params: response.request_params,
                    units: response.units,
                }),
            };
        }
    }

    /// [`wait`](Self::wait), keeping only the handler's result mapping.
    pub async fn wait_till_done(self) -> TanukiResult<Params> {
        Ok(self.wait().await?.result)
    }
}

/// Everything a terminal `Done` response carries, decoded.
pub struct JobOutcome {
    /// Mapping produced by the handler.
    pub result: Params,
    /// Decoded echo of the originating request's params.
    pub request_params: Params,
    /// The worker's opaque side-channel map.
    pub units: serde_json::Map<String, serde_json::Value>,
}

impl Drop for TanukiJob {
    fn drop(&mut self) {
        self.router.remove(&self.job_id);
    }
}

fn remote_error_message(response: &DecodedResponse) -> String {
    match response.result.get("msg") {
        Some(Item::Value(serde_json::Value::String(msg))) => msg.clone(),
        _ => format!("job '{}' failed without a message", response.job_id),
    }
}

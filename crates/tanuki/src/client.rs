//! Client dispatcher.
//!
//! `Tanuki` publishes request letters to a worker group's task queue and runs
//! a background consumer on this instance's private result queue. Responses
//! are routed to their job handle by job id; correlation never depends on
//! arrival order.

use crate::codec::{CodecRegistry, DecodedResponse, Params};
use crate::config::TanukiConfig;
use crate::error::{TanukiError, TanukiResult};
use crate::job::TanukiJob;
use crate::letter::{EncodedPaths, RequestLetter, ResponseLetter};
use crate::session::BrokerSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Callback observing every response letter this client consumes, in
/// addition to per-job delivery.
pub type ResponseObserver = Arc<dyn Fn(&ResponseLetter) + Send + Sync>;

/// A command invocation to dispatch.
pub struct RequestPayload {
    pub command: String,
    pub params: Params,
}

/// Correlation map from job id to that job's local delivery queue. Shared
/// between caller threads (insert on send) and the background consumer
/// (lookup on delivery, removal on terminal consumption).
pub(crate) struct ResponseRouter {
    entries: Mutex<HashMap<String, mpsc::UnboundedSender<DecodedResponse>>>,
    codecs: Arc<CodecRegistry>,
    tolerate_stale: bool,
    observer: Option<ResponseObserver>,
}

impl ResponseRouter {
    pub(crate) fn new(
        codecs: Arc<CodecRegistry>,
        tolerate_stale: bool,
        observer: Option<ResponseObserver>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            codecs,
            tolerate_stale,
            observer,
        }
    }

    pub(crate) fn register(&self, job_id: &str) -> mpsc::UnboundedReceiver<DecodedResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(job_id.to_string(), tx);
        rx
    }

    pub(crate) fn remove(&self, job_id: &str) {
        self.entries.lock().expect("lock poisoned").remove(job_id);
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Decode one wire letter and push it onto its job's delivery queue.
    /// A response for a job this client never issued is a protocol
    /// violation unless stale deliveries are tolerated.
    pub(crate) fn deliver(&self, letter: ResponseLetter) -> TanukiResult<()> {
        if let Some(observer) = &self.observer {
            observer(&letter);
        }

        let response = self.codecs.decode_response(letter)?;
        let entries = self.entries.lock().expect("lock poisoned");
        match entries.get(&response.job_id) {
            Some(tx) => {
                debug!(job_id = %response.job_id, command = %response.command, "Routed response");
                // A dropped receiver means the handle is gone; nothing to do.
                let _ = tx.send(response);
                Ok(())
            }
            None if self.tolerate_stale => {
                debug!(job_id = %response.job_id, "Dropping response for unknown job");
                Ok(())
            }
            None => Err(TanukiError::Protocol(format!(
                "received a response for unknown job '{}'",
                response.job_id
            ))),
        }
    }
}

/// Client dispatcher for one worker group.
pub struct Tanuki {
    worker_name: String,
    session: BrokerSession,
    router: Arc<ResponseRouter>,
    codecs: Arc<CodecRegistry>,
    units: serde_json::Map<String, serde_json::Value>,
    task_queue: String,
    result_queue: String,
    consumer: tokio::task::JoinHandle<()>,
}

impl Tanuki {
    /// Connect to the broker and start the background result consumer for
    /// this instance's private result queue.
    pub async fn connect(worker_name: &str, config: TanukiConfig) -> TanukiResult<Self> {
        Self::connect_with(worker_name, config, CodecRegistry::new(), None).await
    }

    /// Connect with a codec registry and an optional response observer.
    pub async fn connect_with(
        worker_name: &str,
        config: TanukiConfig,
        codecs: CodecRegistry,
        observer: Option<ResponseObserver>,
    ) -> TanukiResult<Self> {
        let codecs = Arc::new(codecs);
        let instance_id = Uuid::new_v4();
        let task_queue = config.task_queue_name(worker_name);
        let result_queue = config.result_queue_name(worker_name, &instance_id);

        let session = BrokerSession::connect(config.clone()).await?;
        let router = Arc::new(ResponseRouter::new(
            codecs.clone(),
            config.tolerate_stale_results,
            observer,
        ));

        let consumer = tokio::spawn(consume_results(
            config,
            result_queue.clone(),
            router.clone(),
        ));

        Ok(Self {
            worker_name: worker_name.to_string(),
            session,
            router,
            codecs,
            units: serde_json::Map::new(),
            task_queue,
            result_queue,
            consumer,
        })
    }

    /// The worker group this client dispatches to.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Set one entry of the opaque side-channel map stamped into every
    /// request.
    pub fn set_unit(&mut self, key: &str, value: serde_json::Value) {
        self.units.insert(key.to_string(), value);
    }

    /// Publish a request letter and return its job handle immediately.
    pub async fn send(&mut self, payload: RequestPayload) -> TanukiResult<TanukiJob> {
        let job_id = Uuid::new_v4().simple().to_string();

        let mut encoded = EncodedPaths::new();
        let params = self.codecs.encode_map(&payload.params, "params", &mut encoded)?;
        let letter = RequestLetter {
            job_id: job_id.clone(),
            result_queue_name: self.result_queue.clone(),
            command: payload.command,
            params,
            units: self.units.clone(),
            encoded,
        };
        let wire = serde_json::to_string(&letter)?;

        // Register before publishing so a fast response cannot race the
        // correlation entry.
        let rx = self.router.register(&job_id);
        if let Err(e) = self.session.publish(&self.task_queue, &wire).await {
            self.router.remove(&job_id);
            return Err(e);
        }

        debug!(job_id = %job_id, queue = %self.task_queue, "Dispatched request");
        Ok(TanukiJob::new(job_id, rx, self.router.clone()))
    }

    /// Build and dispatch a command invocation.
    pub async fn call(&mut self, command: &str, params: Params) -> TanukiResult<TanukiJob> {
        self.send(RequestPayload {
            command: command.to_string(),
            params,
        })
        .await
    }

    /// Dispatch a command and block until its terminal response arrives.
    pub async fn invoke(&mut self, command: &str, params: Params) -> TanukiResult<Params> {
        self.call(command, params).await?.wait_till_done().await
    }
}

impl Drop for Tanuki {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

/// Background consumer loop for one client's private result queue. Restarts
/// its session on stream loss instead of terminating.
async fn consume_results(config: TanukiConfig, queue: String, router: Arc<ResponseRouter>) {
    let mut session = match BrokerSession::connect(config).await {
        Ok(session) => session,
        Err(e) => {
            error!(queue = %queue, error = %e, "Failed to open result consumer session");
            return;
        }
    };

    let mut last_id = "0".to_string();
    loop {
        match session.read_results(&queue, &last_id).await {
            Ok(deliveries) => {
                for delivery in deliveries {
                    last_id = delivery.entry_id;
                    match serde_json::from_str::<ResponseLetter>(&delivery.letter) {
                        Ok(letter) => {
                            if let Err(e) = router.deliver(letter) {
                                error!(queue = %queue, error = %e, "Error processing result");
                            }
                        }
                        Err(e) => {
                            error!(queue = %queue, error = %e, "Malformed response letter");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Stream loss while consuming results");
                if let Err(reopen_err) = session.reopen().await {
                    error!(queue = %queue, error = %reopen_err, "Failed to reopen result session");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

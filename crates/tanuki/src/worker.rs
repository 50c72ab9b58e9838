//! Worker loop.
//!
//! `TanukiWorker` consumes the shared task queue one delivery at a time,
//! resolves the command, executes it inline or on a spawned task, publishes
//! the response, and acknowledges. Spawned tasks never touch the consumer
//! loop's session: they publish through their own response connection and
//! hand their ack intent back over a channel, so the session keeps a single
//! writer.

use crate::codec::{CodecRegistry, Params};
use crate::config::TanukiConfig;
use crate::error::TanukiResult;
use crate::letter::{RequestLetter, Status};
use crate::registry::{CommandEntry, CommandRegistry, ParamSchema};
use crate::response::ResponseConnection;
use crate::session::{BrokerSession, Delivery};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Worker process serving one command group.
pub struct TanukiWorker {
    name: String,
    config: TanukiConfig,
    codecs: Arc<CodecRegistry>,
    registry: CommandRegistry,
    units: serde_json::Map<String, serde_json::Value>,
}

impl TanukiWorker {
    pub fn new(name: &str, config: TanukiConfig) -> Self {
        Self::with_codecs(name, config, CodecRegistry::new())
    }

    pub fn with_codecs(name: &str, config: TanukiConfig, codecs: CodecRegistry) -> Self {
        Self {
            name: name.to_string(),
            config,
            codecs: Arc::new(codecs),
            registry: CommandRegistry::new(),
            units: serde_json::Map::new(),
        }
    }

    /// Register a command under a unique name. `max_concurrency` of 0 runs
    /// the handler inline on the consumer loop; a positive value runs it on
    /// spawned tasks, at most that many outstanding at once.
    pub fn register<F>(
        &mut self,
        name: &str,
        schema: ParamSchema,
        max_concurrency: usize,
        handler: F,
    ) -> TanukiResult<()>
    where
        F: Fn(Params) -> anyhow::Result<Params> + Send + Sync + 'static,
    {
        self.registry.register(name, schema, max_concurrency, handler)
    }

    /// Set one entry of the opaque side-channel map stamped into every
    /// response.
    pub fn set_unit(&mut self, key: &str, value: serde_json::Value) {
        self.units.insert(key.to_string(), value);
    }

    /// Consume the shared task queue until the process is stopped. Stream
    /// loss restarts the session; a bad job never takes the loop down.
    pub async fn run(&self) -> TanukiResult<()> {
        let queue = self.config.task_queue_name(&self.name);
        let mut session = BrokerSession::connect(self.config.clone()).await?;
        session.ensure_task_group(&queue).await?;

        // One response connection for the life of the loop; only spawned
        // command tasks open their own.
        let mut response =
            ResponseConnection::connect(&self.config, self.codecs.clone(), self.units.clone())
                .await?;

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<String>();
        info!(worker = %self.name, queue = %queue, "Worker starts running");

        loop {
            // Ack intents handed back from spawned command tasks.
            while let Ok(entry_id) = ack_rx.try_recv() {
                if let Err(e) = session.ack(&queue, &entry_id).await {
                    warn!(queue = %queue, entry_id = %entry_id, error = %e, "Failed to ack completed job");
                }
            }

            let delivery = match session.read_task(&queue).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Stream loss while consuming tasks");
                    if let Err(reopen_err) = session.reopen().await {
                        error!(queue = %queue, error = %reopen_err, "Failed to reopen task session");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    continue;
                }
            };

            if let Err(e) = self
                .dispatch(&mut session, &mut response, &queue, &delivery, &ack_tx)
                .await
            {
                error!(queue = %queue, error = %e, "Error dispatching task");
                // An entry left pending is never re-served to this consumer,
                // so the requester would wait forever.
                if let Err(ack_err) = session.ack(&queue, &delivery.entry_id).await {
                    warn!(queue = %queue, entry_id = %delivery.entry_id, error = %ack_err, "Failed to ack after dispatch error");
                }
            }
        }
    }

    /// State machine for one delivery: unparseable letters are discarded,
    /// unknown commands answered with an ERROR reply, and known commands
    /// validated and executed inline or on a spawned task.
    async fn dispatch(
        &self,
        session: &mut BrokerSession,
        response: &mut ResponseConnection,
        queue: &str,
        delivery: &Delivery,
        ack_tx: &mpsc::UnboundedSender<String>,
    ) -> TanukiResult<()> {
        let request: RequestLetter = match serde_json::from_str(&delivery.letter) {
            Ok(request) => request,
            Err(e) => {
                error!(queue = %queue, error = %e, "Malformed request letter, discarding");
                session.ack(queue, &delivery.entry_id).await?;
                return Ok(());
            }
        };

        let Some(entry) = self.registry.get(&request.command) else {
            let msg = format!(
                "Tanuki worker {} cannot recognize '{}'.",
                self.name, request.command
            );
            error!(job_id = %request.job_id, command = %request.command, "{msg}");
            if let Err(e) = response.send_status(&request, Status::Error, &msg).await {
                error!(job_id = %request.job_id, error = %e, "Failed to send error response");
            }
            session.ack(queue, &delivery.entry_id).await?;
            return Ok(());
        };

        match entry.semaphore.clone() {
            None => {
                // Inline: publish the response before acking, so the broker
                // holds back the next task until this one is fully done.
                execute_command(&self.codecs, response, &entry, &request).await;
                session.ack(queue, &delivery.entry_id).await?;
            }
            Some(semaphore) => {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Closed semaphores cannot happen while the entry is
                        // alive; treat it as a discarded job.
                        warn!(command = %request.command, "Command pool unavailable, requeueing");
                        return Ok(());
                    }
                };

                let config = self.config.clone();
                let codecs = self.codecs.clone();
                let units = self.units.clone();
                let ack_tx = ack_tx.clone();
                let entry_id = delivery.entry_id.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    match ResponseConnection::connect(&config, codecs.clone(), units).await {
                        Ok(mut response) => {
                            execute_command(&codecs, &mut response, &entry, &request).await;
                        }
                        Err(e) => {
                            error!(job_id = %request.job_id, error = %e, "Failed to open response connection");
                        }
                    }
                    let _ = ack_tx.send(entry_id);
                });
            }
        }

        Ok(())
    }
}

/// Execute one resolved command and publish its terminal response. Every
/// failure mode ends in an ERROR reply; nothing propagates past this
/// boundary.
pub(crate) async fn execute_command(
    codecs: &CodecRegistry,
    response: &mut ResponseConnection,
    entry: &CommandEntry,
    request: &RequestLetter,
) {
    debug!(job_id = %request.job_id, command = %request.command, "Executing command");
    let outcome = run_command(codecs, entry, request).await;

    let sent = match outcome {
        Ok(result) => response.send(request, Status::Done, &result).await,
        Err(msg) => response.send_status(request, Status::Error, &msg).await,
    };
    if let Err(e) = sent {
        error!(job_id = %request.job_id, error = %e, "Failed to publish response");
    }
}

/// Decode, validate, and run one command, mapping every failure to the
/// message an ERROR reply carries. The handler runs on a blocking thread so
/// a panicking or long-running handler cannot take the runtime down with it.
pub(crate) async fn run_command(
    codecs: &CodecRegistry,
    entry: &CommandEntry,
    request: &RequestLetter,
) -> Result<Params, String> {
    let params = codecs.decode_request(request).map_err(|e| e.to_string())?;
    let params = entry.schema.validate(params)?;

    let handler = entry.handler.clone();
    match tokio::task::spawn_blocking(move || handler(params)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("command panicked: {e}")),
    }
}

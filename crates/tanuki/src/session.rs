//! Broker transport session.
//!
//! Owns one Redis connection and hides the stream plumbing: queue/group
//! declaration, publish, blocking consume, ack, and one-shot recovery from
//! stream-loss errors.

use crate::config::TanukiConfig;
use crate::error::{TanukiError, TanukiResult};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult};
use tracing::{debug, info, warn};

/// One letter read from a stream.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The broker entry ID (e.g., "1234567890-0"), needed to ack.
    pub entry_id: String,
    /// The serialized letter.
    pub letter: String,
}

/// A broker connection bound to one configuration.
pub struct BrokerSession {
    client: Client,
    conn: MultiplexedConnection,
    config: TanukiConfig,
    consumer_name: String,
}

impl BrokerSession {
    /// Open a connection to the broker.
    pub async fn connect(config: TanukiConfig) -> TanukiResult<Self> {
        let client = Client::open(config.redis_url().as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let consumer_name = format!("tanuki-{}", uuid::Uuid::new_v4());

        Ok(Self {
            client,
            conn,
            config,
            consumer_name,
        })
    }

    /// Reopen the connection. Idempotent; safe to call after a failure.
    pub async fn reopen(&mut self) -> TanukiResult<()> {
        info!("Reopening broker connection...");
        self.conn = self.client.get_multiplexed_async_connection().await?;
        Ok(())
    }

    /// Publish one letter to a queue. On a stream-loss class of error the
    /// session reopens once and retries the publish exactly once more before
    /// surfacing the error. Task streams persist until trimmed, which is the
    /// durable delivery the task queue relies on.
    pub async fn publish(&mut self, queue: &str, letter: &str) -> TanukiResult<()> {
        match self.publish_once(queue, letter).await {
            Ok(()) => Ok(()),
            Err(TanukiError::Broker(e)) if is_stream_loss(&e) => {
                warn!(queue, error = %e, "Stream loss during publish, retrying once");
                self.reopen().await?;
                self.publish_once(queue, letter).await
            }
            Err(e) => Err(e),
        }
    }

    /// Publish one letter and refresh the queue's TTL, so transient result
    /// queues whose consumer is gone are eventually discarded.
    pub async fn publish_with_ttl(
        &mut self,
        queue: &str,
        letter: &str,
        ttl_secs: u64,
    ) -> TanukiResult<()> {
        self.publish(queue, letter).await?;
        let expired: RedisResult<bool> = self.conn.expire(queue, ttl_secs as i64).await;
        if let Err(e) = expired {
            debug!(queue, error = %e, "Failed to refresh result queue TTL");
        }
        Ok(())
    }

    async fn publish_once(&mut self, queue: &str, letter: &str) -> TanukiResult<()> {
        let entry_id: String = self.conn.xadd(queue, "*", &[("letter", letter)]).await?;
        debug!(queue, entry_id = %entry_id, "Published letter");
        Ok(())
    }

    /// Ensure the consumer group for a task queue exists, creating both the
    /// stream and the group if necessary. The group starts at the beginning
    /// of the stream so tasks published before any worker came up are not
    /// lost.
    pub async fn ensure_task_group(&mut self, queue: &str) -> TanukiResult<()> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => {
                info!(queue, group = %self.config.consumer_group, "Created consumer group");
            }
            // BUSYGROUP means the group already exists, which is fine
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue, group = %self.config.consumer_group, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Read the next task delivery for this consumer, blocking up to the
    /// configured timeout. COUNT=1 is the prefetch policy: combined with the
    /// worker loop acking before the next read, the broker never hands this
    /// consumer a second task while one is in flight.
    pub async fn read_task(&mut self, queue: &str) -> TanukiResult<Option<Delivery>> {
        let value: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config.block_timeout_ms)
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;

        let mut deliveries = parse_stream_reply(value)?;
        Ok(deliveries.pop())
    }

    /// Read every result delivery after `last_id`, blocking up to the
    /// configured timeout. Result queues have a single consumer, so no group
    /// is involved and no ack is required.
    pub async fn read_results(&mut self, queue: &str, last_id: &str) -> TanukiResult<Vec<Delivery>> {
        let value: redis::Value = redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(self.config.block_timeout_ms)
            .arg("STREAMS")
            .arg(queue)
            .arg(last_id)
            .query_async(&mut self.conn)
            .await?;

        parse_stream_reply(value)
    }

    /// Acknowledge a task delivery, removing it from this consumer's pending
    /// list.
    pub async fn ack(&mut self, queue: &str, entry_id: &str) -> TanukiResult<()> {
        let acked: i64 = self
            .conn
            .xack(queue, &self.config.consumer_group, &[entry_id])
            .await?;

        if acked == 1 {
            debug!(queue, entry_id, "Acknowledged task");
        } else {
            warn!(queue, entry_id, "XACK returned {}, entry may not exist", acked);
        }

        Ok(())
    }
}

/// Whether a broker error belongs to the stream-loss class recovered by a
/// reopen-and-retry cycle rather than surfaced immediately.
pub(crate) fn is_stream_loss(e: &redis::RedisError) -> bool {
    e.is_connection_dropped() || e.is_timeout() || matches!(e.kind(), redis::ErrorKind::IoError)
}

/// Parse an XREAD/XREADGROUP reply into deliveries.
///
/// Reply shape: `[[stream_key, [[entry_id, [field, value, ...]]]]]`, or Nil
/// when the block timeout expired.
fn parse_stream_reply(value: redis::Value) -> TanukiResult<Vec<Delivery>> {
    let streams = match value {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Array(streams) => streams,
        other => {
            return Err(TanukiError::Protocol(format!(
                "unexpected stream reply type: {other:?}"
            )))
        }
    };

    let mut deliveries = Vec::new();
    for stream in &streams {
        let entries = match stream {
            redis::Value::Array(parts) if parts.len() == 2 => match &parts[1] {
                redis::Value::Array(entries) => entries,
                _ => {
                    return Err(TanukiError::Protocol(
                        "expected array of stream entries".to_string(),
                    ))
                }
            },
            _ => {
                return Err(TanukiError::Protocol(
                    "malformed stream reply entry".to_string(),
                ))
            }
        };

        for entry in entries {
            let parts = match entry {
                redis::Value::Array(parts) if parts.len() == 2 => parts,
                _ => {
                    return Err(TanukiError::Protocol(
                        "malformed stream entry".to_string(),
                    ))
                }
            };

            let entry_id = value_as_string(&parts[0]).ok_or_else(|| {
                TanukiError::Protocol("expected string entry id".to_string())
            })?;

            let fields = match &parts[1] {
                redis::Value::Array(fields) => fields,
                _ => {
                    return Err(TanukiError::Protocol(
                        "expected array of entry fields".to_string(),
                    ))
                }
            };

            let mut letter = None;
            let mut i = 0;
            while i + 1 < fields.len() {
                if value_as_string(&fields[i]).as_deref() == Some("letter") {
                    letter = value_as_string(&fields[i + 1]);
                    break;
                }
                i += 2;
            }

            let letter = letter.ok_or_else(|| {
                TanukiError::Protocol("stream entry missing letter field".to_string())
            })?;

            deliveries.push(Delivery { entry_id, letter });
        }
    }

    Ok(deliveries)
}

fn value_as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(text) => Some(text.clone()),
        _ => None,
    }
}

//! Configuration for Tanuki clients and workers.

use tracing::warn;
use uuid::Uuid;

/// Environment variable carrying the broker address as `host:port`.
pub const BROKER_URL_ENV: &str = "TANUKI_BROKER_URL";

/// Environment variable naming the site suffix for non-local brokers.
pub const SITE_ENV: &str = "TANUKI_SITE_NAME";

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_SITE: &str = "SPACE";
const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 1000;
const DEFAULT_RESULT_STREAM_TTL_SECS: u64 = 3600;

/// Shared configuration for the client dispatcher and the worker loop.
#[derive(Debug, Clone)]
pub struct TanukiConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Site suffix appended to worker queue names when the broker is not local,
    /// so environments sharing one broker stay separated
    pub site: String,

    /// Consumer group name used on task queues
    pub consumer_group: String,

    /// Blocking read timeout in milliseconds for consume loops
    pub block_timeout_ms: u64,

    /// TTL applied to result streams so orphaned deliveries age out
    pub result_stream_ttl_secs: u64,

    /// Whether responses for unknown job ids are tolerated (dropped with a log
    /// line) instead of being treated as a protocol violation
    pub tolerate_stale_results: bool,
}

impl Default for TanukiConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl TanukiConfig {
    /// Build a configuration from the environment, falling back to a local
    /// broker on the default port.
    pub fn from_env() -> Self {
        let (host, port) = match std::env::var(BROKER_URL_ENV) {
            Ok(url) => parse_broker_url(&url),
            Err(_) => (DEFAULT_HOST.to_string(), DEFAULT_PORT),
        };
        let site = std::env::var(SITE_ENV).unwrap_or_else(|_| DEFAULT_SITE.to_string());

        Self {
            host,
            port,
            site,
            consumer_group: "tanuki".to_string(),
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
            result_stream_ttl_secs: DEFAULT_RESULT_STREAM_TTL_SECS,
            tolerate_stale_results: true,
        }
    }

    /// Build a configuration pointing at an explicit broker address.
    pub fn with_address(host: impl Into<String>, port: u16) -> Self {
        let mut config = Self::from_env();
        config.host = host.into();
        config.port = port;
        config
    }

    /// Redis connection URL for this broker.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    /// Whether the broker runs on this machine.
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1")
    }

    /// The effective worker group name: the site suffix is applied only when
    /// the broker is remote.
    pub fn worker_group_name(&self, worker: &str) -> String {
        if self.is_local() {
            worker.to_string()
        } else {
            format!("{}@{}", worker, self.site)
        }
    }

    /// Name of the shared, durable task queue for a worker group.
    pub fn task_queue_name(&self, worker: &str) -> String {
        format!("task_{}", self.worker_group_name(worker))
    }

    /// Name of the private result queue for one client instance.
    pub fn result_queue_name(&self, worker: &str, instance: &Uuid) -> String {
        format!(
            "result_{}_{}",
            self.worker_group_name(worker),
            instance.simple()
        )
    }
}

/// Parse a `host:port` broker address. The host may itself contain colons
/// (IPv6), so only the last segment is taken as the port.
fn parse_broker_url(url: &str) -> (String, u16) {
    match url.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => {
                warn!(url, "Malformed broker port, falling back to default");
                (host.to_string(), DEFAULT_PORT)
            }
        },
        _ => (url.to_string(), DEFAULT_PORT),
    }
}

//! Error types for Tanuki.

use thiserror::Error;

/// Tanuki error type.
#[derive(Error, Debug)]
pub enum TanukiError {
    /// Broker connection or operation error
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Letter (de)serialization error
    #[error("letter parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value inside a letter that no registered codec claims
    #[error("cannot encode value at '{path}': no codec claims {type_name}")]
    Encoding { path: String, type_name: &'static str },

    /// Protocol error (malformed letters, unresolvable encoded paths,
    /// responses for jobs this client never issued)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error (duplicate command registration, bad address)
    #[error("configuration error: {0}")]
    Config(String),

    /// A failure reported by the remote worker. The message is exactly the
    /// worker-side failure description.
    #[error("{msg}")]
    Remote { msg: String },
}

/// Result type for Tanuki operations.
pub type TanukiResult<T> = Result<T, TanukiError>;

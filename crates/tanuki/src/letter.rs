//! Wire records exchanged over the broker.
//!
//! A letter is a self-describing JSON document. Values the wire format cannot
//! represent natively are replaced in place by a registered codec, and the
//! letter's `encoded` map records which codec to apply at which path on the
//! receiving side (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Processing status carried by a response letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Requested,
    Running,
    Done,
    Error,
}

impl Status {
    /// Whether this status resolves a job. `Running` deliveries are progress
    /// reports and never unblock a waiting caller.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }
}

/// Map of codec name to the slash-separated paths that codec must be applied
/// to when decoding a letter. Every path resolves to a leaf of the top-level
/// field its first segment names.
pub type EncodedPaths = BTreeMap<String, Vec<String>>;

/// A task request published to a worker group's shared task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLetter {
    /// Client-generated correlation token, unique per request.
    pub job_id: String,
    /// The requester's private result queue, where the response goes.
    pub result_queue_name: String,
    /// Name of the registered command to execute.
    pub command: String,
    /// Argument name to value, arbitrarily nested.
    pub params: serde_json::Map<String, Value>,
    /// Opaque side-channel map, passed through unmodified.
    #[serde(default)]
    pub units: serde_json::Map<String, Value>,
    #[serde(default)]
    pub encoded: EncodedPaths,
}

/// Echo of the originating request carried inside a response for
/// traceability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEcho {
    pub command: String,
    pub params: serde_json::Map<String, Value>,
}

/// A response published back to the requester's private result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseLetter {
    /// Echoes the request's job id.
    pub job_id: String,
    pub status: Status,
    pub request: RequestEcho,
    /// Mapping produced by the handler, or `{"msg": <error text>}` on failure.
    pub result: serde_json::Map<String, Value>,
    #[serde(default)]
    pub units: serde_json::Map<String, Value>,
    #[serde(default)]
    pub encoded: EncodedPaths,
}

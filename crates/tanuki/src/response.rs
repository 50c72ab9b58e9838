//! Worker-side response delivery.
//!
//! Turns a handler's return value (or a failure description) into a response
//! letter and publishes it to the requester's private result queue, over a
//! session of its own so spawned command tasks never touch the worker loop's
//! connection.

use crate::codec::{CodecRegistry, Item, Params};
use crate::config::TanukiConfig;
use crate::error::TanukiResult;
use crate::letter::{EncodedPaths, RequestEcho, RequestLetter, ResponseLetter, Status};
use crate::session::BrokerSession;
use serde_json::Value;
use std::sync::Arc;

/// Build a response letter for `request`: the result tree is encoded, and
/// the request echo carries the original wire params with their recorded
/// codec paths remapped under `request/params`.
pub(crate) fn build_response(
    codecs: &CodecRegistry,
    units: &serde_json::Map<String, Value>,
    request: &RequestLetter,
    status: Status,
    result: &Params,
) -> TanukiResult<ResponseLetter> {
    let mut encoded = EncodedPaths::new();
    let result_wire = codecs.encode_map(result, "result", &mut encoded)?;

    for (name, paths) in &request.encoded {
        let remapped = encoded.entry(name.clone()).or_default();
        for path in paths {
            remapped.push(format!("request/{path}"));
        }
    }

    Ok(ResponseLetter {
        job_id: request.job_id.clone(),
        status,
        request: RequestEcho {
            command: request.command.clone(),
            params: request.params.clone(),
        },
        result: result_wire,
        units: units.clone(),
        encoded,
    })
}

/// Build the `{"msg": ...}` result mapping carried by status-only responses.
pub(crate) fn message_result(msg: &str) -> Params {
    let mut result = Params::new();
    result.insert("msg".to_string(), Item::Value(Value::String(msg.to_string())));
    result
}

/// Manages the communication of results back to the requester.
pub struct ResponseConnection {
    session: BrokerSession,
    codecs: Arc<CodecRegistry>,
    units: serde_json::Map<String, Value>,
    ttl_secs: u64,
}

impl ResponseConnection {
    /// Open a dedicated session for publishing responses.
    pub async fn connect(
        config: &TanukiConfig,
        codecs: Arc<CodecRegistry>,
        units: serde_json::Map<String, Value>,
    ) -> TanukiResult<Self> {
        let session = BrokerSession::connect(config.clone()).await?;
        Ok(Self {
            session,
            codecs,
            units,
            ttl_secs: config.result_stream_ttl_secs,
        })
    }

    /// Build and publish a response for `request`. On stream loss the
    /// underlying session reopens once and retries the publish once.
    pub async fn send(
        &mut self,
        request: &RequestLetter,
        status: Status,
        result: &Params,
    ) -> TanukiResult<()> {
        let letter = build_response(&self.codecs, &self.units, request, status, result)?;
        let wire = serde_json::to_string(&letter)?;
        self.session
            .publish_with_ttl(&request.result_queue_name, &wire, self.ttl_secs)
            .await
    }

    /// Publish a status-only response carrying a message.
    pub async fn send_status(
        &mut self,
        request: &RequestLetter,
        status: Status,
        msg: &str,
    ) -> TanukiResult<()> {
        self.send(request, status, &message_result(msg)).await
    }
}

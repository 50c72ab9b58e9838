//! Tanuki: broker-mediated RPC over Redis Streams.
//!
//! A client publishes request letters to a worker group's shared task queue
//! and collects response letters on a private, instance-unique result queue.
//! Workers consume the task queue one delivery at a time, execute registered
//! command handlers, and publish responses back to the requester.
//!
//! # Core Invariants
//!
//! 1. **Correlated**: every response is routed to its job handle by job id,
//!    never by arrival order
//! 2. **One In-Flight**: a worker acks a task only after its response is
//!    published, so the broker holds back the next task (COUNT=1)
//! 3. **Contained**: unknown commands, bad params, and handler failures
//!    become ERROR letters; a worker never dies from one bad job
//! 4. **Lossless**: opaque payload values cross the wire through registered
//!    codecs, with their paths recorded so decoding never guesses
//!
//! # Architecture
//!
//! ```text
//! Tanuki -> task_<worker> stream -> TanukiWorker -> handler
//!   ^                                                  |
//!   |____ result_<worker>_<instance> stream <_________|
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod letter;
pub mod registry;
pub mod response;
pub mod session;
pub mod worker;

#[cfg(test)]
mod tests;

pub use client::{RequestPayload, ResponseObserver, Tanuki};
pub use codec::{AnyObject, Blob, BytesCodec, Codec, CodecRegistry, Item, Params};
pub use config::TanukiConfig;
pub use error::{TanukiError, TanukiResult};
pub use job::{JobOutcome, TanukiJob};
pub use letter::{EncodedPaths, RequestEcho, RequestLetter, ResponseLetter, Status};
pub use registry::{CommandEntry, CommandRegistry, ParamField, ParamKind, ParamSchema};
pub use response::ResponseConnection;
pub use session::{BrokerSession, Delivery};
pub use worker::TanukiWorker;

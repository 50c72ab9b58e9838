//! Integration tests exercising the client and worker paths against an
//! in-memory broker.
//!
//! Organization:
//! - `harness`: MockBroker plus simulators driving the real codec, registry,
//!   execution, and correlation code
//! - `roundtrip`: letters crossing the full wire with codec-claimed leaves
//! - `correlation`: job-id routing, delivery order, stale responses
//! - `scenarios`: end-to-end command flows and failure containment
//! - `backpressure`: prefetch window, queue sharing, redelivery
//! - `transport_failure`: publish retry discipline and lost replies

mod roundtrip;
mod transport_failure;

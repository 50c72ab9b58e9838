//! Publish failures: one reopen-and-retry cycle, exactly one response
//! letter per job, and no stranded deliveries when a reply is lost.

use super::harness::{ClientSim, MockBroker, WorkerSim};
use crate::codec::{CodecRegistry, Params};
use crate::error::TanukiError;
use crate::registry::{ParamKind, ParamSchema};
use serde_json::json;
use std::sync::atomic::Ordering;

fn echo_worker(broker: std::sync::Arc<MockBroker>) -> WorkerSim {
    let mut worker = WorkerSim::new("calc", broker, CodecRegistry::new());
    worker.register("echo", ParamSchema::new().field("tag", ParamKind::Int), |p| Ok(p));
    worker
}

fn tagged(tag: i64) -> Params {
    let mut params = Params::new();
    params.insert("tag".to_string(), tag.into());
    params
}

#[tokio::test]
async fn request_publish_retries_once_after_a_dropped_connection() {
    let broker = MockBroker::new();
    let client = ClientSim::new("calc", broker.clone(), CodecRegistry::new());

    broker.fail_next_publishes(1);
    let _job = client.send("echo", tagged(1)).unwrap();

    assert_eq!(client.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stream_len("task_calc"), 1);
}

#[tokio::test]
async fn consecutive_publish_failures_surface_and_clear_the_correlation_entry() {
    let broker = MockBroker::new();
    let client = ClientSim::new("calc", broker.clone(), CodecRegistry::new());

    broker.fail_next_publishes(2);
    let err = client.send("echo", tagged(1)).unwrap_err();

    assert!(matches!(err, TanukiError::Broker(_)));
    assert_eq!(client.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stream_len("task_calc"), 0);
    assert_eq!(client.router.outstanding(), 0);
}

#[tokio::test]
async fn response_publish_retries_once_and_sends_a_single_letter() {
    let broker = MockBroker::new();
    let worker = echo_worker(broker.clone());
    let client = ClientSim::new("calc", broker.clone(), CodecRegistry::new());

    let job = client.send("echo", tagged(7)).unwrap();
    broker.fail_next_publishes(1);
    worker.drain().await;

    assert_eq!(worker.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stream_len(&client.result_queue), 1);

    client.pump().unwrap();
    let result = job.wait_till_done().await.unwrap();
    assert_eq!(result["tag"].as_value(), Some(&json!(7)));
}

#[tokio::test]
async fn delivery_is_acked_even_when_the_reply_is_lost() {
    let broker = MockBroker::new();
    let worker = echo_worker(broker.clone());
    let client = ClientSim::new("calc", broker.clone(), CodecRegistry::new());

    let lost = client.send("echo", tagged(1)).unwrap();
    let answered = client.send("echo", tagged(2)).unwrap();

    // Both publish attempts for the first reply fail; the second reply is
    // unaffected.
    broker.fail_next_publishes(2);
    worker.drain().await;

    assert_eq!(broker.pending_count("task_calc"), 0);
    assert_eq!(broker.ack_count(), 2);
    assert_eq!(broker.stream_len(&client.result_queue), 1);

    client.pump().unwrap();
    let result = answered.wait_till_done().await.unwrap();
    assert_eq!(result["tag"].as_value(), Some(&json!(2)));
    drop(lost);
    assert_eq!(client.router.outstanding(), 0);
}

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use runner::config::{Millis, QueueConfig};
use runner::events::{EventType, MemoryBus};
use runner::queue::{MemoryQueue, WorkQueue};
use runner::registry::JobRegistry;
use runner::sandbox::ExecutionPipeline;
use runner::worker::{requeue_abandoned, worker};

fn queue_config() -> QueueConfig {
    QueueConfig {
        name: "test".to_string(),
        wait_seconds: 1,
        retry_delay: Millis(50),
    }
}

// Polls until `job_id` has a terminal event on the bus
async fn wait_for_terminal(bus: &MemoryBus, job_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !bus.events(job_id).iter().any(|e| e.is_terminal()) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "No terminal event for job {job_id}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_worker_rejects_invalid_jobs_and_keeps_going() {
    let bus = Arc::new(MemoryBus::new());
    let queue = Arc::new(MemoryQueue::new());
    let jobs_dir = std::env::temp_dir().join(format!("runner-worker-{}", std::process::id()));
    let pipeline = ExecutionPipeline::new(bus.clone(), JobRegistry::new(), jobs_dir);
    let token = CancellationToken::new();

    queue.push("definitely not json").await;
    queue
        .push(r#"{"job_id":"bad-lang","file_name":"main","source_code":"x","language":"cobol"}"#)
        .await;
    queue.push(r#"{"job_id":"bad-fields","language":"python"}"#).await;
    queue
        .push(r#"{"job_id":"bad-name","file_name":"../etc","source_code":"x","language":"python"}"#)
        .await;

    let handle = tokio::spawn(worker(
        1,
        queue.clone(),
        pipeline,
        queue_config(),
        token.clone(),
    ));

    for job_id in ["bad-lang", "bad-fields", "bad-name"] {
        wait_for_terminal(&bus, job_id).await;
        let events = bus.events(job_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventType::Termination);
        assert_eq!(events[0].outcome().unwrap().exit_code, 2);
    }
    assert!(
        bus.events("bad-lang")[0]
            .outcome()
            .unwrap()
            .reason
            .as_deref()
            .unwrap()
            .contains("cobol")
    );

    // Every message was acknowledged before it was processed
    assert!(queue.is_empty().await);
    assert_eq!(queue.in_flight_len().await, 0);

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_worker_runs_jobs_in_order() {
    let has_python = std::process::Command::new("which")
        .arg("python3")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if !has_python {
        eprintln!("python3 not found, skipping");
        return;
    }

    let bus = Arc::new(MemoryBus::new());
    let queue = Arc::new(MemoryQueue::new());
    let jobs_dir = std::env::temp_dir().join(format!("runner-worker-seq-{}", std::process::id()));
    let pipeline = ExecutionPipeline::new(bus.clone(), JobRegistry::new(), jobs_dir);
    let token = CancellationToken::new();

    for i in 0..3 {
        queue
            .push(format!(
                r#"{{"job_id":"seq-{i}","file_name":"main","source_code":"print({i})","language":"python"}}"#
            ))
            .await;
    }
    let handle = tokio::spawn(worker(1, queue.clone(), pipeline, queue_config(), token.clone()));

    wait_for_terminal(&bus, "seq-2").await;
    for i in 0..3 {
        let events = bus.events(&format!("seq-{i}"));
        assert_eq!(events[0].text(), Some(format!("{i}\n").as_str()));
        assert_eq!(events.last().unwrap().kind, EventType::Completion);
    }

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_stops_while_idle() {
    let bus = Arc::new(MemoryBus::new());
    let queue = Arc::new(MemoryQueue::new());
    let pipeline = ExecutionPipeline::new(bus, JobRegistry::new(), std::env::temp_dir());
    let token = CancellationToken::new();

    let handle = tokio::spawn(worker(2, queue, pipeline, queue_config(), token.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_abandoned_message_is_requeued_after_shutdown() {
    let bus = Arc::new(MemoryBus::new());
    let queue = Arc::new(MemoryQueue::new());
    let pipeline = ExecutionPipeline::new(bus.clone(), JobRegistry::new(), std::env::temp_dir());
    let token = CancellationToken::new();

    queue
        .push(r#"{"job_id":"parked","file_name":"main","source_code":"x","language":"cobol"}"#)
        .await;
    // Taken off the queue by a receive that never got to acknowledge it
    let parked = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
    assert!(queue.is_empty().await);

    let handle = tokio::spawn(worker(3, queue.clone(), pipeline, queue_config(), token.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    handle.await.unwrap().unwrap();
    assert!(bus.events("parked").is_empty());

    assert_eq!(requeue_abandoned(queue.as_ref()).await, 1);
    assert_eq!(queue.len().await, 1);
    assert_eq!(queue.in_flight_len().await, 0);
    let again = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(again.body, parked.body);
    assert_eq!(requeue_abandoned(queue.as_ref()).await, 0);
}

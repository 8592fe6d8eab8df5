use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sink_memory::MemorySink;
use source_channel::{ChannelHandle, ChannelSource};
use tracker_api::{TopicObservation, WriteFailure};
use tracker_engine::{
    ConnectionState, Coordinator, CoordinatorState, CoordinatorStatus, EngineError, IngestConfig, IngestReport,
    PartialFailurePolicy,
};

struct Harness {
    handle: ChannelHandle,
    sink: Arc<MemorySink>,
    status: watch::Receiver<CoordinatorStatus>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<IngestReport, EngineError>>,
}

fn config(batch_size: usize) -> IngestConfig {
    let mut config = IngestConfig::with_subscriptions(["#"]);
    config.batch_size = batch_size;
    config.flush_interval_ms = 60_000;
    config.shutdown_retry_delay_ms = 10;
    config
}

fn start_with(config: IngestConfig, source: ChannelSource, handle: ChannelHandle, sink: MemorySink) -> Harness {
    let sink = Arc::new(sink);
    let coordinator = Coordinator::new(config, Arc::new(source), sink.clone()).unwrap();
    let status = coordinator.status();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(shutdown.clone()));
    Harness {
        handle,
        sink,
        status,
        shutdown,
        task,
    }
}

fn start(config: IngestConfig, sink: MemorySink) -> Harness {
    let (source, handle) = ChannelSource::new();
    start_with(config, source, handle, sink)
}

impl Harness {
    async fn wait(&mut self, what: impl FnMut(&CoordinatorStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), self.status.wait_for(what))
            .await
            .expect("timed out waiting for coordinator status")
            .expect("coordinator dropped its status channel");
    }

    async fn running(&mut self) {
        self.wait(|s| s.state == CoordinatorState::Running && !s.subscribing).await;
    }

    fn observe(&self, topics: &[&str]) {
        for topic in topics {
            assert!(self.handle.observe(*topic), "source refused {topic}");
        }
    }

    async fn stop(self) -> (Result<IngestReport, EngineError>, Arc<MemorySink>, ChannelHandle) {
        self.shutdown.cancel();
        let result = self.task.await.unwrap();
        (result, self.sink, self.handle)
    }
}

fn topics(records: &[TopicObservation]) -> Vec<String> {
    records.iter().map(|r| r.topic.clone()).collect()
}

#[tokio::test]
async fn full_batch_is_written_and_remainder_stays_buffered() {
    let mut h = start(config(3), MemorySink::new());
    h.running().await;

    h.observe(&["t1", "t2", "t3", "t4"]);
    h.wait(|s| s.written == 3 && s.buffered == 1 && !s.in_flight).await;

    let committed = h.sink.committed().await;
    assert_eq!(committed.len(), 1);
    assert_eq!(topics(&committed[0]), ["t1", "t2", "t3"]);

    let (result, sink, _) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.written, 4);
    assert_eq!(topics(&sink.committed().await[1]), ["t4"]);
}

#[tokio::test]
async fn failed_batch_goes_back_ahead_of_later_arrivals() {
    let sink = MemorySink::with_delay(Duration::from_millis(200));
    sink.fail_next(WriteFailure::total("connection reset")).await;
    let mut h = start(config(2), sink);
    h.running().await;

    h.observe(&["t1", "t2"]);
    h.wait(|s| s.in_flight).await;
    h.observe(&["t3"]);
    h.wait(|s| s.write_failures == 1 && s.buffered == 3 && !s.in_flight).await;

    let (result, sink, _) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.write_failures, 1);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.lost, 0);

    let attempts = sink.attempts().await;
    assert_eq!(attempts.len(), 3);
    assert_eq!(topics(&attempts[0]), ["t1", "t2"]);
    assert_eq!(topics(&attempts[1]), ["t1", "t2"]);
    assert_eq!(topics(&attempts[2]), ["t3"]);
    assert_eq!(topics(&sink.records().await), ["t1", "t2", "t3"]);
}

#[tokio::test]
async fn backlog_is_written_in_batch_sized_chunks() {
    let mut h = start(config(2), MemorySink::with_delay(Duration::from_millis(100)));
    h.running().await;

    let names: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
    for name in &names {
        assert!(h.handle.observe(name.clone()));
    }
    h.wait(|s| s.written == 12 && !s.in_flight).await;

    let sizes: Vec<usize> = h.sink.attempts().await.iter().map(Vec::len).collect();
    assert_eq!(sizes, [2; 6]);
    assert_eq!(topics(&h.sink.records().await), names);

    let (result, _, _) = h.stop().await;
    result.unwrap();
}

#[tokio::test]
async fn failed_write_holds_size_flushes_until_next_tick() {
    let sink = MemorySink::new();
    sink.fail_next(WriteFailure::total("503")).await;
    let mut h = start(config(2), sink);
    h.running().await;

    h.observe(&["t0", "t1"]);
    h.wait(|s| s.write_failures == 1 && s.buffered == 2 && !s.in_flight).await;

    let names: Vec<String> = (2..10).map(|i| format!("t{i}")).collect();
    for name in &names {
        assert!(h.handle.observe(name.clone()));
    }
    h.wait(|s| s.buffered == 10).await;
    assert_eq!(h.sink.attempts().await.len(), 1);

    let (result, sink, _) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.written, 10);
    assert_eq!(report.lost, 0);

    let attempts = sink.attempts().await;
    assert_eq!(attempts.len(), 6);
    assert!(attempts.iter().all(|a| a.len() <= 2));
    let expected: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
    assert_eq!(topics(&sink.records().await), expected);
}

#[tokio::test(start_paused = true)]
async fn timer_retries_requeued_backlog_one_batch_at_a_time() {
    let sink = MemorySink::new();
    sink.fail_next(WriteFailure::total("connection reset")).await;
    let mut cfg = config(3);
    cfg.flush_interval_ms = 5_000;
    let mut h = start(cfg, sink);
    h.running().await;

    h.observe(&["t1", "t2", "t3"]);
    h.wait(|s| s.write_failures == 1 && s.buffered == 3).await;
    h.observe(&["t4", "t5", "t6", "t7"]);
    h.wait(|s| s.buffered == 7).await;
    assert_eq!(h.sink.attempts().await.len(), 1);

    h.wait(|s| s.written == 7 && !s.in_flight).await;
    let sizes: Vec<usize> = h.sink.attempts().await.iter().map(Vec::len).collect();
    assert_eq!(sizes, [3, 3, 3, 1]);
    assert_eq!(
        topics(&h.sink.records().await),
        ["t1", "t2", "t3", "t4", "t5", "t6", "t7"]
    );

    let (result, _, _) = h.stop().await;
    assert_eq!(result.unwrap().requeued, 3);
}

#[tokio::test]
async fn shutdown_flushes_buffer_before_stopping() {
    let mut h = start(config(100), MemorySink::new());
    h.running().await;

    h.observe(&["t5", "t6"]);
    h.wait(|s| s.buffered == 2).await;

    let mut status = h.status.clone();
    let (result, sink, handle) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.observed, 2);
    assert_eq!(report.written, 2);

    assert_eq!(topics(&sink.records().await), ["t5", "t6"]);
    assert!(sink.is_closed());
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(status.borrow_and_update().state, CoordinatorState::Stopped);
}

#[tokio::test]
async fn only_one_write_is_in_flight_at_a_time() {
    let mut h = start(config(2), MemorySink::with_delay(Duration::from_millis(50)));
    h.running().await;

    let names: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
    for name in &names {
        assert!(h.handle.observe(name.clone()));
    }
    h.wait(|s| s.written == 10 && !s.in_flight).await;

    assert_eq!(h.sink.peak_concurrency(), 1);
    assert_eq!(topics(&h.sink.records().await), names);

    let (result, _, _) = h.stop().await;
    assert_eq!(result.unwrap().write_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn timer_flushes_partial_batch_after_interval() {
    let mut cfg = config(100);
    cfg.flush_interval_ms = 5_000;
    let mut h = start(cfg, MemorySink::new());
    h.running().await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(h.sink.attempts().await.is_empty(), "empty buffer must not be written");

    h.observe(&["t1"]);
    h.wait(|s| s.buffered == 1).await;
    h.wait(|s| s.written == 1).await;
    assert_eq!(topics(&h.sink.records().await), ["t1"]);

    let (result, sink, _) = h.stop().await;
    result.unwrap();
    assert_eq!(sink.attempts().await.len(), 1);
}

#[tokio::test]
async fn disconnect_suspends_ingestion_until_resubscribed() {
    let mut h = start(config(100), MemorySink::new());
    h.running().await;

    h.observe(&["before"]);
    h.wait(|s| s.buffered == 1).await;

    h.handle.disconnected("keepalive timeout");
    h.wait(|s| s.connection == ConnectionState::Disconnected).await;
    assert!(!h.handle.observe("during outage"));

    h.handle.reconnecting(1);
    h.wait(|s| s.connection == ConnectionState::Reconnecting).await;
    h.handle.connected();
    h.wait(|s| s.connection == ConnectionState::Connected && !s.subscribing).await;
    assert_eq!(h.handle.subscribe_calls(), ["#", "#"]);

    h.observe(&["after"]);
    h.wait(|s| s.buffered == 2).await;

    let (result, sink, _) = h.stop().await;
    assert_eq!(result.unwrap().observed, 2);
    assert_eq!(topics(&sink.records().await), ["before", "after"]);
}

#[tokio::test]
async fn observations_queued_before_a_disconnect_are_flushed_at_shutdown() {
    let mut h = start(config(100), MemorySink::new());
    h.running().await;

    h.observe(&["t1"]);
    h.wait(|s| s.buffered == 1).await;

    // Queued behind the lifecycle signal, which the loop handles first.
    h.observe(&["t2", "t3"]);
    h.handle.disconnected("broker restart");
    h.wait(|s| s.connection == ConnectionState::Disconnected).await;

    let (result, sink, _) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.lost, 0);
    assert_eq!(report.observed, 3);
    assert_eq!(topics(&sink.records().await), ["t1", "t2", "t3"]);
}

#[tokio::test]
async fn rejected_subscription_does_not_stop_ingestion() {
    let (source, handle) = ChannelSource::new();
    handle.reject("secret/#", "not authorized");
    let mut cfg = config(1);
    cfg.subscriptions = vec!["secret/#".into(), "orders/#".into()];
    let mut h = start_with(cfg, source, handle, MemorySink::new());
    h.running().await;

    h.observe(&["orders/created"]);
    h.wait(|s| s.written == 1).await;
    assert_eq!(h.handle.subscribe_calls(), ["secret/#", "orders/#"]);

    let (result, _, _) = h.stop().await;
    result.unwrap();
}

#[tokio::test]
async fn terminal_connect_failure_aborts_startup() {
    let (source, handle) = ChannelSource::manual();
    handle.connect_failed("connection refused");
    let h = start_with(config(10), source, handle, MemorySink::new());

    let result = h.task.await.unwrap();
    assert!(matches!(result, Err(EngineError::Connection(ref reason)) if reason == "connection refused"));
    assert!(h.handle.subscribe_calls().is_empty());
    assert_eq!(h.sink.init_calls(), 1);
    assert_eq!(h.status.borrow().state, CoordinatorState::Stopped);
}

#[tokio::test]
async fn sink_bootstrap_failure_aborts_before_connecting() {
    let sink = MemorySink::new();
    sink.fail_init("cluster unavailable").await;
    let h = start(config(10), sink);

    let result = h.task.await.unwrap();
    let err = result.unwrap_err();
    assert!(err.is_startup());
    assert!(matches!(err, EngineError::SinkInit(_)));
    assert!(h.handle.subscribe_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_final_flush_reports_lost_records() {
    let sink = MemorySink::new();
    sink.fail_next(WriteFailure::total("503")).await;
    sink.fail_next(WriteFailure::total("503")).await;
    let mut cfg = config(100);
    cfg.shutdown_attempts = 2;
    cfg.shutdown_retry_delay_ms = 1_000;
    let mut h = start(cfg, sink);
    h.running().await;

    h.observe(&["t1", "t2"]);
    h.wait(|s| s.buffered == 2).await;

    let (result, sink, _) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.lost, 2);
    assert_eq!(report.write_failures, 2);
    assert_eq!(report.written, 0);
    assert_eq!(sink.attempts().await.len(), 2);
    assert!(sink.records().await.is_empty());
}

#[tokio::test]
async fn retry_rejected_policy_requeues_only_rejected_records() {
    let sink = MemorySink::new();
    sink.fail_next(WriteFailure::partial("mapper_parsing_exception", 2, vec![1])).await;
    let mut cfg = config(3);
    cfg.partial_failure = PartialFailurePolicy::RetryRejected;
    let mut h = start(cfg, sink);
    h.running().await;

    h.observe(&["a", "b", "c"]);
    h.wait(|s| s.write_failures == 1 && s.buffered == 1).await;

    let (result, sink, _) = h.stop().await;
    let report = result.unwrap();
    assert_eq!(report.written, 3);
    assert_eq!(report.requeued, 1);
    assert_eq!(topics(&sink.records().await), ["a", "c", "b"]);
}

#[tokio::test]
async fn retry_all_policy_rewrites_accepted_records() {
    let sink = MemorySink::new();
    sink.fail_next(WriteFailure::partial("mapper_parsing_exception", 2, vec![1])).await;
    let mut h = start(config(3), sink);
    h.running().await;

    h.observe(&["a", "b", "c"]);
    h.wait(|s| s.write_failures == 1 && s.buffered == 3).await;

    let (result, sink, _) = h.stop().await;
    assert_eq!(result.unwrap().requeued, 3);
    assert_eq!(topics(&sink.records().await), ["a", "c", "a", "b", "c"]);
}

#[tokio::test]
async fn losing_the_source_drains_buffer_and_reports_it() {
    let mut h = start(config(100), MemorySink::new());
    h.running().await;

    h.observe(&["t1"]);
    h.wait(|s| s.buffered == 1).await;
    h.handle.connect_failed("reconnect attempts exhausted");

    let result = h.task.await.unwrap();
    assert!(matches!(result, Err(EngineError::SourceLost(_))));
    assert_eq!(topics(&h.sink.records().await), ["t1"]);
}

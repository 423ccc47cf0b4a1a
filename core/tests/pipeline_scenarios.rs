use batch_core::accumulator::CloseReason;
use batch_core::{
    AckLedger, BatchConfig, BatchReport, Decision, Deliveries, MemorySource, MessageMetadata,
    MessageSource, PipelineError, ReliableBatcher, SinkError, SourceError, TransformError,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type Batches = Arc<Mutex<Vec<Vec<String>>>>;

fn payloads(count: u32) -> Vec<String> {
    (0..count).map(|i| i.to_string()).collect()
}

/// Prefixes "a" after a short delay, failing payloads >= `fail_from`.
fn prefix_a_below(
    fail_from: u32,
) -> impl Fn(String) -> futures::future::BoxFuture<'static, Result<String, TransformError>>
+ Send
+ Sync
+ 'static {
    move |payload: String| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let n: u32 = payload
                .parse()
                .map_err(|_| TransformError::from("not a number"))?;
            if n < fail_from {
                Ok(format!("a{payload}"))
            } else {
                Err(TransformError::from("foobar"))
            }
        })
    }
}

fn recording_sink(
    batches: &Batches,
) -> impl Fn(Vec<String>) -> futures::future::Ready<Result<(), SinkError>> + Send + Sync + 'static
{
    let batches = Arc::clone(batches);
    move |batch| {
        batches.lock().unwrap().push(batch);
        futures::future::ready(Ok(()))
    }
}

/// Delivers a single message after a quiet period, then stays subscribed.
struct LateSource {
    quiet_for: Duration,
    ledger: AckLedger,
}

impl MessageSource for LateSource {
    type Payload = String;

    async fn consume(self, deliveries: Deliveries<String>) -> Result<(), SourceError> {
        tokio::time::sleep(self.quiet_for).await;
        let ledger = self.ledger.clone();
        deliveries.deliver(
            "0".to_string(),
            move || ledger.record(0, Decision::Ack),
            || {},
            MessageMetadata::new(0, "late"),
        )?;
        deliveries.closed().await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_all_transforms_succeed() {
    let source = MemorySource::new("hello", payloads(5));
    let ledger = source.ledger();
    let batches = Batches::default();

    let reports: Vec<BatchReport> = ReliableBatcher::new(
        source,
        prefix_a_below(u32::MAX),
        recording_sink(&batches),
        BatchConfig::new(5, Duration::from_secs(5)),
    )
    .unwrap()
    .run()
    .map(|r| r.unwrap())
    .collect()
    .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].close_reason, CloseReason::Size);
    assert!(reports[0].is_fully_acked());
    assert_eq!(
        *batches.lock().unwrap(),
        vec![vec!["a0", "a1", "a2", "a3", "a4"]]
    );
    assert_eq!(ledger.acks(), 5);
    assert_eq!(ledger.nacks(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_failed_transforms_are_nacked_and_excluded() {
    let source = MemorySource::new("hello", payloads(5));
    let ledger = source.ledger();
    let batches = Batches::default();

    let reports: Vec<BatchReport> = ReliableBatcher::new(
        source,
        prefix_a_below(3),
        recording_sink(&batches),
        BatchConfig::new(5, Duration::from_secs(5)),
    )
    .unwrap()
    .run()
    .map(|r| r.unwrap())
    .collect()
    .await;

    assert_eq!(*batches.lock().unwrap(), vec![vec!["a0", "a1", "a2"]]);
    assert_eq!(ledger.acks(), 3);
    assert_eq!(ledger.nacks(), 2);
    assert_eq!(ledger.acked_tags(), vec![0, 1, 2]);
    assert_eq!(ledger.nacked_tags(), vec![3, 4]);

    let report = &reports[0];
    assert_eq!(report.attempts, 5);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.nacked(), 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_sink_failure_leaves_window_unacked_and_redelivery_acks_once() {
    let ledger = AckLedger::new();
    let source = MemorySource::new("hello", payloads(5)).with_ledger(ledger.clone());
    let rejecting_sink = |_batch: Vec<String>| async { Err::<(), _>("warehouse unavailable") };

    let mut reports = ReliableBatcher::new(
        source,
        prefix_a_below(u32::MAX),
        rejecting_sink,
        BatchConfig::new(5, Duration::from_secs(5)),
    )
    .unwrap()
    .run();

    let err = reports.next().await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Sink { window_id: 0, .. }));
    assert!(err.is_retryable());
    assert!(reports.next().await.is_none());
    assert_eq!(reports.metrics().sink_failures, 1);
    assert_eq!(ledger.acks(), 0);
    assert_eq!(ledger.nacks(), 0);

    // the broker redelivers the same messages to a fresh subscription
    let batches = Batches::default();
    let redelivery = MemorySource::new("hello", payloads(5))
        .with_ledger(ledger.clone())
        .redelivered();
    let reports: Vec<_> = ReliableBatcher::new(
        redelivery,
        prefix_a_below(u32::MAX),
        recording_sink(&batches),
        BatchConfig::new(5, Duration::from_secs(5)),
    )
    .unwrap()
    .run()
    .collect()
    .await;

    assert!(reports.iter().all(|r| r.is_ok()));
    assert_eq!(batches.lock().unwrap().len(), 1);
    for tag in 0..5 {
        assert_eq!(ledger.decisions_for(tag), vec![Decision::Ack]);
    }
}

#[tokio::test(start_paused = true)]
async fn sink_failure_keeps_nacks_already_issued() {
    let source = MemorySource::new("hello", payloads(5));
    let ledger = source.ledger();
    let rejecting_sink = |_batch: Vec<String>| async { Err::<(), _>("warehouse unavailable") };

    let reports: Vec<_> = ReliableBatcher::new(
        source,
        prefix_a_below(3),
        rejecting_sink,
        BatchConfig::new(5, Duration::from_secs(5)),
    )
    .unwrap()
    .run()
    .collect()
    .await;

    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_err());
    assert_eq!(ledger.nacked_tags(), vec![3, 4]);
    assert_eq!(ledger.acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn every_message_decided_exactly_once_across_window_shapes() {
    for (count, max_batch_size, fail_from) in [(1, 1, 0), (7, 3, 5), (12, 5, 2), (10, 4, 100)] {
        let source = MemorySource::new("hello", payloads(count));
        let ledger = source.ledger();
        let batches = Batches::default();

        let reports: Vec<BatchReport> = ReliableBatcher::new(
            source,
            prefix_a_below(fail_from),
            recording_sink(&batches),
            BatchConfig::new(max_batch_size, Duration::from_secs(5)),
        )
        .unwrap()
        .run()
        .map(|r| r.unwrap())
        .collect()
        .await;

        for tag in 0..count as u64 {
            assert_eq!(ledger.decisions_for(tag).len(), 1, "message {tag}");
        }
        assert!(reports.iter().all(|r| r.attempts <= max_batch_size));
        assert_eq!(reports.len(), batches.lock().unwrap().len());

        let expected: Vec<String> = (0..count.min(fail_from)).map(|i| format!("a{i}")).collect();
        let delivered: Vec<String> = batches.lock().unwrap().concat();
        assert_eq!(delivered, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn empty_window_still_reaches_the_sink() {
    let source = MemorySource::new("hello", payloads(2));
    let ledger = source.ledger();
    let batches = Batches::default();

    let reports: Vec<BatchReport> = ReliableBatcher::new(
        source,
        prefix_a_below(0),
        recording_sink(&batches),
        BatchConfig::new(2, Duration::from_secs(5)),
    )
    .unwrap()
    .run()
    .map(|r| r.unwrap())
    .collect()
    .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].succeeded, 0);
    assert_eq!(*batches.lock().unwrap(), vec![Vec::<String>::new()]);
    assert_eq!(ledger.nacks(), 2);
}

#[tokio::test(start_paused = true)]
async fn transform_timeout_bounds_a_stalled_window() {
    let source = MemorySource::new("hello", payloads(3)).keep_open();
    let ledger = source.ledger();
    let batches = Batches::default();
    let stall_first = |payload: String| async move {
        if payload == "0" {
            futures::future::pending::<()>().await;
        }
        Ok::<_, TransformError>(payload)
    };
    let config = BatchConfig::new(3, Duration::from_secs(5))
        .with_transform_timeout(Duration::from_secs(2));

    let mut reports = ReliableBatcher::new(source, stall_first, recording_sink(&batches), config)
        .unwrap()
        .run();

    let report = reports.next().await.unwrap().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].delivery_tag, 0);
    assert_eq!(*batches.lock().unwrap(), vec![vec!["1", "2"]]);
    assert_eq!(ledger.nacked_tags(), vec![0]);
    assert_eq!(ledger.acked_tags(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn window_clock_runs_from_subscription_not_first_delivery() {
    let ledger = AckLedger::new();
    let source = LateSource {
        quiet_for: Duration::from_secs(4),
        ledger: ledger.clone(),
    };
    let batches = Batches::default();

    let started = Instant::now();
    let mut reports = ReliableBatcher::new(
        source,
        prefix_a_below(u32::MAX),
        recording_sink(&batches),
        BatchConfig::new(5, Duration::from_secs(5)),
    )
    .unwrap()
    .run();

    let report = reports.next().await.unwrap().unwrap();
    let closed_after = started.elapsed();
    assert!(closed_after >= Duration::from_secs(5));
    assert!(closed_after < Duration::from_secs(6), "closed after {closed_after:?}");
    assert_eq!(report.window_id, 0);
    assert_eq!(report.close_reason, CloseReason::Elapsed);
    assert_eq!(report.attempts, 1);
    assert_eq!(*batches.lock().unwrap(), vec![vec!["a0"]]);
    assert_eq!(ledger.acked_tags(), vec![0]);
}

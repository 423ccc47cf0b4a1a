use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::accumulator::{BatchAccumulator, ClosedWindow};
use crate::barrier::{self, Settlement};
use crate::config::{BatchConfig, PartialWindowPolicy};
use crate::errors::{PipelineError, Result, SourceError};
use crate::report::BatchReport;
use crate::sink::BatchSink;
use crate::source::{Deliveries, Message, MessageSource};
use crate::telemetry::{MetricsRecorder, PipelineMetrics};
use crate::transform::{Transform, TransformAttempt, start_attempt};

/// Reports buffered for a slow subscriber before the sink stage waits.
const OUTPUT_BUFFER: usize = 16;

/// Work handed from the accumulation task to the sink task, in window
/// close order.
enum WindowJob<P, V> {
    Settle {
        window_id: u64,
        handle: JoinHandle<Option<Settlement<P, V>>>,
    },
    Abort(PipelineError),
}

/// The batcher orchestrates the data flow from source -> transform ->
/// window -> batch sink, and turns each window's outcome back into
/// per-message acks and nacks.
///
/// High-level logic:
/// 1. Every delivered message starts its transform immediately.
/// 2. Attempts are grouped into windows closed by size or elapsed time.
///    The first window opens on subscription and each close opens the
///    next, so an idle window still closes (empty) when its time is up.
/// 3. Each closed window settles on its own task; failed attempts are
///    nacked as soon as they are seen.
/// 4. Settled windows reach the batch sink one at a time, in close order.
/// 5. Successful messages are acked only once the sink completed. If the
///    sink fails, nothing in that window is acked and the stream ends
///    with the error.
pub struct ReliableBatcher<S, T, K> {
    source: S,
    transform: Arc<T>,
    sink: Arc<K>,
    config: BatchConfig,
}

impl<S, T, K> ReliableBatcher<S, T, K>
where
    S: MessageSource,
    T: Transform<S::Payload>,
    K: BatchSink<T::Output>,
{
    pub fn new(source: S, transform: T, sink: K, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            transform: Arc::new(transform),
            sink: Arc::new(sink),
            config,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Subscribes to the source and returns the stream of window reports.
    /// Must be called from within a tokio runtime.
    pub fn run(self) -> BatchReportStream {
        let ReliableBatcher {
            source,
            transform,
            sink,
            config,
        } = self;

        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsRecorder::default());
        let (deliveries, arrivals) = Deliveries::channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);

        info!(
            max_batch_size = config.max_batch_size,
            max_batch_window_ms = config.max_batch_window_ms,
            "Subscribing to message source"
        );
        let accumulator = BatchAccumulator::new(
            config.max_batch_size,
            config.max_batch_window(),
            Instant::now(),
        );
        let source_task = tokio::spawn(source.consume(deliveries));

        let accumulation = Accumulation {
            accumulator,
            arrivals,
            source_task,
            transform,
            config,
            jobs: jobs_tx,
            cancel: cancel.clone(),
            metrics: Arc::clone(&metrics),
        };
        tokio::spawn(accumulation.run());
        tokio::spawn(complete_windows(
            jobs_rx,
            sink,
            output_tx,
            cancel.clone(),
            Arc::clone(&metrics),
        ));

        BatchReportStream {
            reports: ReceiverStream::new(output_rx),
            cancel: cancel.clone(),
            metrics,
            _unsubscribe: cancel.drop_guard(),
        }
    }
}

/// The single writer of the open window.
struct Accumulation<P, T: Transform<P>> {
    accumulator: BatchAccumulator<TransformAttempt<P, T::Output>>,
    arrivals: mpsc::UnboundedReceiver<Message<P>>,
    source_task: JoinHandle<std::result::Result<(), SourceError>>,
    transform: Arc<T>,
    config: BatchConfig,
    jobs: mpsc::UnboundedSender<WindowJob<P, T::Output>>,
    cancel: CancellationToken,
    metrics: Arc<MetricsRecorder>,
}

impl<P, T> Accumulation<P, T>
where
    P: Clone + Send + 'static,
    T: Transform<P>,
{
    async fn run(self) {
        let Accumulation {
            mut accumulator,
            mut arrivals,
            mut source_task,
            transform,
            config,
            jobs,
            cancel,
            metrics,
        } = self;

        let timeout = config.transform_timeout();
        let accept = |accumulator: &mut BatchAccumulator<_>, message: Message<P>| {
            metrics.message_received();
            debug!(delivery_tag = message.delivery_tag(), "Received message");
            let attempt = start_attempt(&transform, message, timeout);
            if let Some(window) = accumulator.push(attempt, Instant::now()) {
                dispatch(window, &jobs, &cancel, &metrics);
            }
        };

        let joined = loop {
            let deadline = accumulator.deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    source_task.abort();
                    debug!(pending = accumulator.len(), "Subscription cancelled, stopped consuming");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(window) = accumulator.close_if_elapsed(Instant::now()) {
                        dispatch(window, &jobs, &cancel, &metrics);
                    }
                }
                Some(message) = arrivals.recv() => accept(&mut accumulator, message),
                joined = &mut source_task => break joined,
            }
        };

        // deliveries that raced the source's completion
        arrivals.close();
        while let Ok(message) = arrivals.try_recv() {
            accept(&mut accumulator, message);
        }

        let outcome = joined.unwrap_or_else(|e| Err(SourceError::Unrecoverable(Box::new(e))));
        match outcome {
            Ok(()) => {
                info!(pending = accumulator.len(), "Message source completed");
                match config.on_source_end {
                    PartialWindowPolicy::Flush => {
                        if let Some(window) = accumulator.flush(Instant::now()) {
                            dispatch(window, &jobs, &cancel, &metrics);
                        }
                    }
                    PartialWindowPolicy::Discard => {
                        let dropped = accumulator.discard(Instant::now());
                        if !dropped.is_empty() {
                            warn!(
                                count = dropped.len(),
                                "Discarding partial window, its messages are left for redelivery"
                            );
                        }
                        for attempt in dropped {
                            attempt.result.abort_handle().abort();
                        }
                    }
                }
            }
            Err(err) => {
                error!(error = %err, pending = accumulator.len(), "Message source failed, terminating subscription");
                cancel.cancel();
                let _ = jobs.send(WindowJob::Abort(PipelineError::Source(err)));
            }
        }
    }
}

/// Starts the settlement barrier of a closed window on its own task and
/// queues it for the sink stage.
fn dispatch<P, V>(
    window: ClosedWindow<TransformAttempt<P, V>>,
    jobs: &mpsc::UnboundedSender<WindowJob<P, V>>,
    cancel: &CancellationToken,
    metrics: &Arc<MetricsRecorder>,
) where
    P: Send + 'static,
    V: Send + 'static,
{
    debug!(
        window = window.info.id,
        size = window.info.size,
        reason = ?window.info.reason,
        "Window closed"
    );
    metrics.window_closed(window.info.size);

    let window_id = window.info.id;
    let cancel = cancel.clone();
    let metrics = Arc::clone(metrics);
    let handle = tokio::spawn(async move {
        let settled = barrier::settle(window, &cancel).await;
        if let Some(settlement) = &settled {
            metrics.nacked(settlement.failures.len());
        }
        settled
    });

    if jobs.send(WindowJob::Settle { window_id, handle }).is_err() {
        debug!("Sink stage has stopped, window will not be completed");
    }
}

/// Hands settled windows to the batch sink one at a time and acks their
/// successes once the sink completed.
async fn complete_windows<P, V, K>(
    mut jobs: mpsc::UnboundedReceiver<WindowJob<P, V>>,
    sink: Arc<K>,
    output: mpsc::Sender<Result<BatchReport>>,
    cancel: CancellationToken,
    metrics: Arc<MetricsRecorder>,
) where
    K: BatchSink<V>,
{
    while let Some(job) = jobs.recv().await {
        let settlement = match job {
            WindowJob::Abort(err) => {
                let _ = output.send(Err(err)).await;
                return;
            }
            WindowJob::Settle { window_id, handle } => match handle.await {
                Ok(Some(settlement)) => settlement,
                Ok(None) => continue,
                Err(source) => {
                    error!(
                        window = window_id,
                        error = %source,
                        "Settlement task failed, terminating subscription"
                    );
                    cancel.cancel();
                    let _ = output
                        .send(Err(PipelineError::Settlement { window_id, source }))
                        .await;
                    return;
                }
            },
        };
        if cancel.is_cancelled() {
            continue;
        }

        let Settlement {
            info,
            succeeded,
            values,
            failures,
        } = settlement;
        let window_id = info.id;

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => continue,
            completion = sink.complete(values) => completion,
        };

        if let Err(source) = completion {
            metrics.sink_failed();
            error!(
                window = window_id,
                error = %source,
                unacked = succeeded.len(),
                "Batch sink failed, leaving window un-acked"
            );
            cancel.cancel();
            let _ = output
                .send(Err(PipelineError::Sink { window_id, source }))
                .await;
            return;
        }

        let mut acked = 0;
        for message in &succeeded {
            if cancel.is_cancelled() {
                break;
            }
            if message.ack() {
                acked += 1;
            }
        }
        metrics.window_completed(acked);

        let report = BatchReport::new(info, succeeded.len(), acked, failures);
        info!(
            window = report.window_id,
            attempts = report.attempts,
            acked = report.acked,
            nacked = report.nacked(),
            reason = ?report.close_reason,
            "Window settled"
        );
        if output.send(Ok(report)).await.is_err() {
            debug!("Report stream dropped, stopping");
            cancel.cancel();
            return;
        }
    }
}

/// Per-window settlement reports, in window close order.
///
/// Ends after the source completed and every window was reported, or right
/// after the first error. Dropping the stream unsubscribes: consumption
/// stops and no further ack or nack is issued.
pub struct BatchReportStream {
    reports: ReceiverStream<Result<BatchReport>>,
    cancel: CancellationToken,
    metrics: Arc<MetricsRecorder>,
    _unsubscribe: DropGuard,
}

impl BatchReportStream {
    /// Unsubscribes without dropping the stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.snapshot()
    }
}

impl Stream for BatchReportStream {
    type Item = Result<BatchReport>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.reports.poll_next_unpin(cx)
    }
}

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accumulator::{ClosedWindow, WindowInfo};
use crate::report::FailureRecord;
use crate::source::Message;
use crate::transform::{SettlementOutcome, TransformAttempt};

/// A closed window after every attempt resolved. Failed messages have
/// already been nacked; succeeded ones are waiting for the batch sink.
#[derive(Debug)]
pub struct Settlement<P, V> {
    pub info: WindowInfo,
    /// Messages whose transform succeeded, in arrival order.
    pub succeeded: Vec<Message<P>>,
    /// Their values, index-aligned with `succeeded`.
    pub values: Vec<V>,
    pub failures: Vec<FailureRecord>,
}

/// Aborts the transforms of a window that are still running when dropped.
struct AbortOutstanding(Vec<AbortHandle>);

impl Drop for AbortOutstanding {
    fn drop(&mut self) {
        self.0.iter().for_each(|abort| abort.abort());
    }
}

/// Waits for every attempt of `window` to settle.
///
/// Failures are nacked the moment they are observed, in completion order,
/// and never stop the remaining attempts from settling. Returns `None`
/// without touching any further message once `cancel` fires. Transforms
/// still running when this returns early, or when the future is dropped,
/// are aborted.
pub async fn settle<P, V>(
    window: ClosedWindow<TransformAttempt<P, V>>,
    cancel: &CancellationToken,
) -> Option<Settlement<P, V>> {
    let ClosedWindow { info, attempts } = window;
    let size = attempts.len();

    let mut sources = Vec::with_capacity(size);
    let mut outstanding = AbortOutstanding(Vec::with_capacity(size));
    let mut pending = FuturesUnordered::new();
    for (index, attempt) in attempts.into_iter().enumerate() {
        let (source, result) = attempt.into_parts();
        outstanding.0.push(result.abort_handle());
        sources.push(Some(source));
        pending.push(async move { (index, result.settle().await) });
    }

    let mut values: Vec<Option<V>> = (0..size).map(|_| None).collect();
    let mut failures = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = pending.next() => match next {
                Some(settled) => Some(settled),
                None => break,
            },
        };
        let Some((index, outcome)) = next else {
            debug!(window = info.id, "settlement cancelled");
            return None;
        };

        match outcome {
            SettlementOutcome::Success(value) => values[index] = Some(value),
            SettlementOutcome::Failure(reason) => {
                let Some(message) = sources[index].take() else {
                    continue;
                };
                if cancel.is_cancelled() {
                    debug!(window = info.id, "settlement cancelled");
                    return None;
                }
                warn!(
                    window = info.id,
                    delivery_tag = message.delivery_tag(),
                    error = %reason,
                    "Transform failed, nacking message"
                );
                message.nack();
                failures.push(FailureRecord {
                    delivery_tag: message.delivery_tag(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    let (succeeded, values) = sources
        .into_iter()
        .zip(values)
        .filter_map(|(message, value)| Some((message?, value?)))
        .unzip();

    Some(Settlement {
        info,
        succeeded,
        values,
        failures,
    })
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

use crate::errors::TransformError;
use crate::source::Message;

/// The per-message asynchronous transform.
///
/// Any `Fn(P) -> impl Future<Output = Result<V, E>>` with `E: Into<TransformError>`
/// is a transform.
pub trait Transform<P>: Send + Sync + 'static {
    type Output: Send + 'static;

    fn transform(
        &self,
        payload: P,
    ) -> impl Future<Output = Result<Self::Output, TransformError>> + Send;
}

impl<P, F, Fut, V, E> Transform<P> for F
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send,
    V: Send + 'static,
    E: Into<TransformError>,
{
    type Output = V;

    fn transform(&self, payload: P) -> impl Future<Output = Result<V, TransformError>> + Send {
        let pending = self(payload);
        async move { pending.await.map_err(Into::into) }
    }
}

/// How one attempt resolved. Inspected, never raised.
#[derive(Debug)]
pub enum SettlementOutcome<V> {
    Success(V),
    Failure(TransformError),
}

impl<V> SettlementOutcome<V> {
    pub fn is_success(&self) -> bool {
        matches!(self, SettlementOutcome::Success(_))
    }
}

/// The not-yet-settled result of a transform running on its own task.
#[derive(Debug)]
pub struct PendingResult<V> {
    handle: JoinHandle<Result<V, TransformError>>,
}

impl<V> PendingResult<V> {
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    pub async fn settle(self) -> SettlementOutcome<V> {
        match self.handle.await {
            Ok(Ok(value)) => SettlementOutcome::Success(value),
            Ok(Err(err)) => SettlementOutcome::Failure(err),
            Err(join_err) if join_err.is_panic() => {
                SettlementOutcome::Failure(TransformError::Panicked)
            }
            Err(_) => SettlementOutcome::Failure(TransformError::Rejected {
                reason: "transform task was cancelled".to_string(),
            }),
        }
    }
}

/// One message paired with the transform started for it on arrival.
#[derive(Debug)]
pub struct TransformAttempt<P, V> {
    pub source: Message<P>,
    pub result: PendingResult<V>,
}

impl<P, V> TransformAttempt<P, V> {
    pub fn into_parts(self) -> (Message<P>, PendingResult<V>) {
        (self.source, self.result)
    }
}

/// Starts `transform` on a copy of the message's payload right away and
/// returns the attempt holding the message and its pending result.
pub fn start_attempt<P, T>(
    transform: &Arc<T>,
    message: Message<P>,
    timeout: Option<Duration>,
) -> TransformAttempt<P, T::Output>
where
    P: Clone + Send + 'static,
    T: Transform<P>,
{
    let transform = Arc::clone(transform);
    let payload = message.payload().clone();
    let handle = tokio::spawn(async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, transform.transform(payload))
                .await
                .unwrap_or_else(|_| {
                    Err(TransformError::TimedOut {
                        after_ms: limit.as_millis() as u64,
                    })
                }),
            None => transform.transform(payload).await,
        }
    });

    TransformAttempt {
        source: message,
        result: PendingResult { handle },
    }
}

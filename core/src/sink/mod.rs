pub mod json_lines;

use std::future::Future;

use crate::errors::SinkError;

/// The `BatchSink` trait defines the contract for any destination system.
/// It receives the successful values of one window, in arrival order, and
/// resolves once their aggregate effect is durable. Only then are the
/// window's messages acked.
///
/// Any `Fn(Vec<V>) -> impl Future<Output = Result<(), E>>` with
/// `E: Into<SinkError>` is a sink.
pub trait BatchSink<V>: Send + Sync + 'static {
    fn complete(&self, batch: Vec<V>) -> impl Future<Output = Result<(), SinkError>> + Send;
}

impl<V, F, Fut, E> BatchSink<V> for F
where
    F: Fn(Vec<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<SinkError>,
{
    fn complete(&self, batch: Vec<V>) -> impl Future<Output = Result<(), SinkError>> + Send {
        let pending = self(batch);
        async move { pending.await.map_err(Into::into) }
    }
}

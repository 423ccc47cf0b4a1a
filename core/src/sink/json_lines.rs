use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::SinkError;
use crate::sink::BatchSink;

/// Writes every batch as a single JSON array line and flushes it before
/// reporting completion.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<V, W> BatchSink<V> for JsonLinesSink<W>
where
    V: Serialize + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn complete(&self, batch: Vec<V>) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&batch).map_err(|e| SinkError::Rejected {
            reason: format!("batch is not serializable: {e}"),
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        debug!(values = batch.len(), bytes = line.len(), "Wrote batch");
        Ok(())
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::errors::SourceError;
use crate::source::{Deliveries, MessageMetadata, MessageSource};

/// Acks and nacks issued against a [`LinesSource`].
#[derive(Debug, Default)]
pub struct LineCounters {
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl LineCounters {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn nacked(&self) -> u64 {
        self.nacked.load(Ordering::Relaxed)
    }
}

/// Delivers each non-blank line of a reader as one message, tagged with
/// its 1-based line number.
///
/// Lines have no broker behind them, so ack and nack only count and log.
pub struct LinesSource<R> {
    name: String,
    reader: R,
    counters: Arc<LineCounters>,
}

impl<R> LinesSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            counters: Arc::new(LineCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<LineCounters> {
        Arc::clone(&self.counters)
    }
}

impl<R> MessageSource for LinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    type Payload = String;

    async fn consume(self, deliveries: Deliveries<String>) -> Result<(), SourceError> {
        let mut lines = self.reader.lines();
        let mut line_number = 0u64;

        loop {
            let next = tokio::select! {
                _ = deliveries.closed() => {
                    debug!(source = %self.name, "pipeline stopped listening, closing input");
                    return Ok(());
                }
                next = lines.next_line() => next,
            };

            let line = match next? {
                Some(line) => line,
                None => break,
            };
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            let tag = line_number;
            let ack_counters = Arc::clone(&self.counters);
            let nack_counters = Arc::clone(&self.counters);
            deliveries.deliver(
                line,
                move || {
                    ack_counters.acked.fetch_add(1, Ordering::Relaxed);
                    debug!(line = tag, "acked");
                },
                move || {
                    nack_counters.nacked.fetch_add(1, Ordering::Relaxed);
                    warn!(line = tag, "nacked");
                },
                MessageMetadata::new(tag, self.name.as_str()),
            )?;
        }

        info!(source = %self.name, lines = line_number, "Reached end of input");
        Ok(())
    }
}

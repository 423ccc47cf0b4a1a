use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batch_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub messages_received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub windows_closed: u64,
    pub windows_completed: u64,
    pub sink_failures: u64,
    pub avg_batch_size: f64,
}

/// Counters shared by the pipeline's tasks.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    messages_received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    windows_closed: AtomicU64,
    windowed_messages: AtomicU64,
    windows_completed: AtomicU64,
    sink_failures: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn window_closed(&self, size: usize) {
        self.windows_closed.fetch_add(1, Ordering::Relaxed);
        self.windowed_messages
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub(crate) fn nacked(&self, count: usize) {
        self.nacked.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn window_completed(&self, acked: usize) {
        self.windows_completed.fetch_add(1, Ordering::Relaxed);
        self.acked.fetch_add(acked as u64, Ordering::Relaxed);
    }

    pub(crate) fn sink_failed(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineMetrics {
        let windows_closed = self.windows_closed.load(Ordering::Relaxed);
        let windowed = self.windowed_messages.load(Ordering::Relaxed);
        PipelineMetrics {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            windows_closed,
            windows_completed: self.windows_completed.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            avg_batch_size: if windows_closed == 0 {
                0.0
            } else {
                windowed as f64 / windows_closed as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages_window_sizes() {
        let recorder = MetricsRecorder::default();
        assert_eq!(recorder.snapshot(), PipelineMetrics::default());

        recorder.window_closed(5);
        recorder.window_closed(2);
        recorder.nacked(2);
        recorder.window_completed(3);

        let metrics = recorder.snapshot();
        assert_eq!(metrics.windows_closed, 2);
        assert_eq!(metrics.avg_batch_size, 3.5);
        assert_eq!(metrics.acked, 3);
        assert_eq!(metrics.nacked, 2);
    }
}

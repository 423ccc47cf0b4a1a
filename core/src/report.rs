use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accumulator::{CloseReason, WindowInfo};

/// A message whose transform failed and which was nacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub delivery_tag: u64,
    pub reason: String,
}

/// The settlement of one closed window, emitted on the output stream after
/// the batch sink completed and the window's successes were acked.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub window_id: u64,
    pub close_reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
    /// Attempts that joined the window.
    pub attempts: usize,
    /// Values handed to the batch sink, in arrival order.
    pub succeeded: usize,
    /// Acks actually issued; lower than `succeeded` only if the
    /// subscription was cancelled while acking.
    pub acked: usize,
    pub failures: Vec<FailureRecord>,
}

impl BatchReport {
    pub(crate) fn new(
        info: WindowInfo,
        succeeded: usize,
        acked: usize,
        failures: Vec<FailureRecord>,
    ) -> Self {
        Self {
            window_id: info.id,
            close_reason: info.reason,
            opened_at: info.opened_at,
            closed_at: info.closed_at,
            settled_at: Utc::now(),
            attempts: info.size,
            succeeded,
            acked,
            failures,
        }
    }

    pub fn nacked(&self) -> usize {
        self.failures.len()
    }

    pub fn is_fully_acked(&self) -> bool {
        self.failures.is_empty() && self.acked == self.attempts
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// The threshold that closed a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The window reached `max_batch_size` attempts.
    Size,
    /// `max_batch_window` elapsed since the window opened.
    Elapsed,
    /// The source completed while the window was partially filled.
    SourceEnded,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    /// Windows are numbered from 0 in the order they close.
    pub id: u64,
    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub size: usize,
}

#[derive(Debug)]
pub struct ClosedWindow<A> {
    pub info: WindowInfo,
    pub attempts: Vec<A>,
}

/// Groups attempts into non-overlapping windows bounded by count and by
/// time since the window opened, whichever comes first.
///
/// Window 0 opens when the accumulator is created and every close opens
/// the next one, so a window always has a deadline, even while empty. An
/// empty window that reaches its deadline closes like any other.
///
/// The accumulator never sleeps on its own: the owner asks for
/// [`BatchAccumulator::deadline`] and calls
/// [`BatchAccumulator::close_if_elapsed`] when it fires.
#[derive(Debug)]
pub struct BatchAccumulator<A> {
    max_batch_size: usize,
    max_batch_window: Duration,
    next_window_id: u64,
    open: Vec<A>,
    opened: (Instant, DateTime<Utc>),
}

impl<A> BatchAccumulator<A> {
    /// Creates the accumulator with window 0 opened at `now`.
    pub fn new(max_batch_size: usize, max_batch_window: Duration, now: Instant) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_batch_window,
            next_window_id: 0,
            open: Vec::with_capacity(max_batch_size),
            opened: (now, Utc::now()),
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// When the open window must close by time.
    pub fn deadline(&self) -> Instant {
        self.opened.0 + self.max_batch_window
    }

    /// Appends an attempt, closing the window if it became full.
    pub fn push(&mut self, attempt: A, now: Instant) -> Option<ClosedWindow<A>> {
        self.open.push(attempt);

        if self.open.len() >= self.max_batch_size {
            return Some(self.close(CloseReason::Size, now));
        }
        None
    }

    /// Closes the open window, empty or not, once its deadline passed.
    pub fn close_if_elapsed(&mut self, now: Instant) -> Option<ClosedWindow<A>> {
        if now >= self.deadline() {
            return Some(self.close(CloseReason::Elapsed, now));
        }
        None
    }

    /// Closes a partially filled window after the source completed. An
    /// empty window has nothing left to settle and is not closed.
    pub fn flush(&mut self, now: Instant) -> Option<ClosedWindow<A>> {
        if self.open.is_empty() {
            return None;
        }
        Some(self.close(CloseReason::SourceEnded, now))
    }

    /// Drops the open window, returning its attempts unsettled, and opens
    /// a fresh one at `now`.
    pub fn discard(&mut self, now: Instant) -> Vec<A> {
        self.opened = (now, Utc::now());
        std::mem::replace(&mut self.open, Vec::with_capacity(self.max_batch_size))
    }

    fn close(&mut self, reason: CloseReason, now: Instant) -> ClosedWindow<A> {
        let closed_at = Utc::now();
        let (_, opened_at) = std::mem::replace(&mut self.opened, (now, closed_at));
        let attempts = std::mem::replace(&mut self.open, Vec::with_capacity(self.max_batch_size));

        let id = self.next_window_id;
        self.next_window_id += 1;

        ClosedWindow {
            info: WindowInfo {
                id,
                reason,
                opened_at,
                closed_at,
                size: attempts.len(),
            },
            attempts,
        }
    }
}

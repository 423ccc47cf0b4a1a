use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::errors::SourceError;
use crate::source::{Deliveries, MessageMetadata, MessageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Ack,
    Nack,
}

/// Records every raw ack/nack invocation per delivery tag.
///
/// Shared between sources so a redelivery can be checked against what was
/// decided the first time round.
#[derive(Debug, Clone, Default)]
pub struct AckLedger {
    entries: Arc<Mutex<Vec<(u64, Decision)>>>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, delivery_tag: u64, decision: Decision) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((delivery_tag, decision));
    }

    pub fn acks(&self) -> usize {
        self.count(Decision::Ack)
    }

    pub fn nacks(&self) -> usize {
        self.count(Decision::Nack)
    }

    pub fn acked_tags(&self) -> Vec<u64> {
        self.tags(Decision::Ack)
    }

    pub fn nacked_tags(&self) -> Vec<u64> {
        self.tags(Decision::Nack)
    }

    pub fn decisions_for(&self, delivery_tag: u64) -> Vec<Decision> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(tag, _)| *tag == delivery_tag)
            .map(|(_, decision)| *decision)
            .collect()
    }

    fn count(&self, decision: Decision) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, d)| *d == decision)
            .count()
    }

    fn tags(&self, decision: Decision) -> Vec<u64> {
        let mut tags: Vec<u64> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, d)| *d == decision)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        tags
    }
}

/// Replays a fixed list of payloads as deliveries tagged `0..n`.
pub struct MemorySource<P> {
    name: String,
    payloads: Vec<P>,
    ledger: AckLedger,
    redelivered: bool,
    failure: Option<String>,
    keep_open: bool,
}

impl<P> MemorySource<P> {
    pub fn new(name: impl Into<String>, payloads: impl IntoIterator<Item = P>) -> Self {
        Self {
            name: name.into(),
            payloads: payloads.into_iter().collect(),
            ledger: AckLedger::new(),
            redelivered: false,
            failure: None,
            keep_open: false,
        }
    }

    /// Records into an existing ledger instead of a fresh one.
    pub fn with_ledger(mut self, ledger: AckLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Marks every delivery as a redelivery.
    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    /// Fails the subscription once all payloads have been delivered.
    pub fn fail_after_delivery(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Keeps the subscription open after the last payload, like a live
    /// queue, until the pipeline stops listening.
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    pub fn ledger(&self) -> AckLedger {
        self.ledger.clone()
    }
}

impl<P: Clone + Send + 'static> MessageSource for MemorySource<P> {
    type Payload = P;

    async fn consume(self, deliveries: Deliveries<P>) -> Result<(), SourceError> {
        let MemorySource {
            name,
            payloads,
            ledger,
            redelivered,
            failure,
            keep_open,
        } = self;

        for (tag, payload) in payloads.into_iter().enumerate() {
            let tag = tag as u64;
            let metadata = MessageMetadata::new(tag, name.as_str()).redelivered(redelivered);
            let ack_ledger = ledger.clone();
            let nack_ledger = ledger.clone();
            deliveries.deliver(
                payload,
                move || ack_ledger.record(tag, Decision::Ack),
                move || nack_ledger.record(tag, Decision::Nack),
                metadata,
            )?;
        }
        debug!(source = %name, "delivered all in-memory payloads");

        if let Some(reason) = failure {
            return Err(SourceError::Connection {
                source: reason.into(),
            });
        }
        if keep_open {
            deliveries.closed().await;
        }
        Ok(())
    }
}

pub mod lines;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::errors::SourceError;

/// A side-effecting acknowledgment primitive bound to one delivery.
pub type AckFn = Arc<dyn Fn() + Send + Sync>;

/// Delivery metadata, opaque to the pipeline apart from the tag used in
/// reports and logs.
#[derive(Debug, Clone, Serialize)]
pub struct MessageMetadata {
    /// Identifies the delivery within its source, e.g. a broker delivery tag or line number.
    pub delivery_tag: u64,
    /// Queue, topic or stream name the message came from.
    pub source: String,
    pub received_at: DateTime<Utc>,
    /// Whether the source has delivered this message before.
    pub redelivered: bool,
    /// Optional key/value headers.
    pub headers: HashMap<String, String>,
}

impl MessageMetadata {
    pub fn new(delivery_tag: u64, source: impl Into<String>) -> Self {
        Self {
            delivery_tag,
            source: source.into(),
            received_at: Utc::now(),
            redelivered: false,
            headers: HashMap::new(),
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message received from a source, carrying its own ack/nack handles.
///
/// At most one of [`Message::ack`] and [`Message::nack`] reaches the
/// underlying source: the first call decides, every later call is a no-op
/// returning `false`.
pub struct Message<P> {
    payload: P,
    metadata: MessageMetadata,
    ack: AckFn,
    nack: AckFn,
    decided: AtomicBool,
}

impl<P> Message<P> {
    pub fn new(
        payload: P,
        ack: impl Fn() + Send + Sync + 'static,
        nack: impl Fn() + Send + Sync + 'static,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            payload,
            metadata,
            ack: Arc::new(ack),
            nack: Arc::new(nack),
            decided: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn delivery_tag(&self) -> u64 {
        self.metadata.delivery_tag
    }

    /// Acknowledges the message. Returns whether this call made the decision.
    pub fn ack(&self) -> bool {
        self.decide(&self.ack)
    }

    /// Negatively acknowledges the message. Returns whether this call made the decision.
    pub fn nack(&self) -> bool {
        self.decide(&self.nack)
    }

    pub fn is_decided(&self) -> bool {
        self.decided.load(Ordering::Acquire)
    }

    fn decide(&self, handle: &AckFn) -> bool {
        if self.decided.swap(true, Ordering::AcqRel) {
            return false;
        }
        handle();
        true
    }
}

impl<P: fmt::Debug> fmt::Debug for Message<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .field("decided", &self.is_decided())
            .finish()
    }
}

/// The sending half handed to a [`MessageSource`]. Every delivery pushed
/// through it becomes one [`Message`] in the pipeline.
///
/// The channel is unbounded: sources are never slowed down, so bursts are
/// absorbed by the accumulator.
pub struct Deliveries<P> {
    tx: mpsc::UnboundedSender<Message<P>>,
}

impl<P> Clone for Deliveries<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> Deliveries<P> {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Message<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Mirrors a broker consume callback: `(payload, ack, nack, metadata)`.
    pub fn deliver(
        &self,
        payload: P,
        ack: impl Fn() + Send + Sync + 'static,
        nack: impl Fn() + Send + Sync + 'static,
        metadata: MessageMetadata,
    ) -> Result<(), SourceError> {
        self.send(Message::new(payload, ack, nack, metadata))
    }

    pub fn send(&self, message: Message<P>) -> Result<(), SourceError> {
        self.tx.send(message).map_err(|_| SourceError::Closed)
    }

    /// True once the pipeline stopped listening, e.g. after unsubscribe.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the pipeline stopped listening.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Any per-message, acknowledgment-capable stream: a broker queue, a
/// Kinesis shard, a file of lines.
///
/// `consume` owns one subscription. It pushes every delivery into
/// `deliveries` and returns when the subscription completes (`Ok`) or
/// fails (`Err`). A returned error is fatal to the pipeline.
pub trait MessageSource: Send + 'static {
    type Payload: Clone + Send + 'static;

    fn consume(
        self,
        deliveries: Deliveries<Self::Payload>,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;
}

//! Reliable batched delivery between a per-message, acknowledgment-capable
//! source and a batch-oriented sink.
//!
//! Messages are transformed as they arrive, grouped into windows bounded by
//! count or time, and acknowledged only once their window's batch has been
//! durably completed. A failed transform nacks its own message and nothing
//! else.
//!
//! ```no_run
//! use batch_core::{BatchConfig, MemorySource, ReliableBatcher, SinkError, TransformError};
//! use futures::StreamExt;
//!
//! # async fn run() -> batch_core::Result<()> {
//! let source = MemorySource::new("hello", ["0", "1", "2"]);
//! let transform = |payload: &'static str| async move {
//!     Ok::<_, TransformError>(format!("a{payload}"))
//! };
//! let sink = |batch: Vec<String>| async move {
//!     println!("{batch:?}");
//!     Ok::<(), SinkError>(())
//! };
//!
//! let mut reports = ReliableBatcher::new(source, transform, sink, BatchConfig::default())?.run();
//! while let Some(report) = reports.next().await {
//!     let report = report?;
//!     println!("window {} acked {}", report.window_id, report.acked);
//! }
//! # Ok(())
//! # }
//! ```
pub mod accumulator;
pub mod barrier;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod report;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod transform;

pub use config::{BatchConfig, PartialWindowPolicy, RelayConfig};
pub use errors::{PipelineError, Result, SinkError, SourceError, TransformError};
pub use pipeline::{BatchReportStream, ReliableBatcher};
pub use report::{BatchReport, FailureRecord};
pub use sink::BatchSink;
pub use source::memory::{AckLedger, Decision, MemorySource};
pub use source::{Deliveries, Message, MessageMetadata, MessageSource};
pub use transform::{SettlementOutcome, Transform};

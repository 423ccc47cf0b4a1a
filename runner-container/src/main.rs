use anyhow::{Context, Result};
use batch_core::config::{SourceType, load_config};
use batch_core::sink::json_lines::JsonLinesSink;
use batch_core::source::lines::LinesSource;
use batch_core::telemetry::init_tracing;
use batch_core::{ReliableBatcher, TransformError};
use futures::StreamExt;
use serde_json::Value;
use tokio::io::BufReader;
use tracing::{error, info};

/// This is the entry point for running a long-lived batching job on container
/// hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config (path as first argument, otherwise `RELAY_CONFIG`).
///     Consume newline-delimited JSON from stdin until it closes:
///         - lines that are not valid JSON are nacked
///         - every window's valid documents are written to stdout as one JSON array
///         - documents are acked once their array has been flushed
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;
    let pipeline = config.pipeline;
    info!(pipeline = %pipeline.name, "Starting pipeline");

    let source = match pipeline.source.source_type {
        SourceType::Stdin => LinesSource::new(
            pipeline.source.name.clone(),
            BufReader::new(tokio::io::stdin()),
        ),
    };
    let counters = source.counters();
    let parse_json = |line: String| async move {
        serde_json::from_str::<Value>(&line).map_err(TransformError::from)
    };
    let sink = JsonLinesSink::new(tokio::io::stdout());

    let mut reports = ReliableBatcher::new(source, parse_json, sink, pipeline.batching)
        .context("Invalid batching configuration")?
        .run();

    while let Some(report) = reports.next().await {
        match report {
            Ok(report) => {
                info!(
                    report = %serde_json::to_string(&report)?,
                    "Window completed"
                );
            }
            Err(e) => {
                error!(
                    retryable = e.is_retryable(),
                    retry_delay_ms = e.get_retry_delay_ms(),
                    "Pipeline terminated: {:?}",
                    e
                );
                return Err(e).context("Batching pipeline failed");
            }
        }
    }

    let metrics = reports.metrics();
    info!(
        metrics = %serde_json::to_string(&metrics)?,
        acked = counters.acked(),
        nacked = counters.nacked(),
        "Input exhausted, all windows settled"
    );
    Ok(())
}

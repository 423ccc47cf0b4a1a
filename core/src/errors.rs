use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Message source error")]
    Source(#[from] SourceError),

    #[error("Batch sink failed for window {window_id}")]
    Sink {
        window_id: u64,
        #[source]
        source: SinkError,
    },

    #[error("Settlement of window {window_id} did not finish")]
    Settlement {
        window_id: u64,
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the subscription can be retried")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("The pipeline is no longer accepting deliveries")]
    Closed,
}

/// Why a single message's transform did not produce a value.
///
/// Transform failures never leave their window: the message is nacked and
/// its siblings carry on.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Transform rejected the payload: {reason}")]
    Rejected { reason: String },

    #[error("Transform did not settle within {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("Transform task panicked")]
    Panicked,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Batch completion rejected: {reason}")]
    Rejected { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for TransformError {
    fn from(err: serde_json::Error) -> Self {
        TransformError::Rejected {
            reason: err.to_string(),
        }
    }
}

impl From<&str> for TransformError {
    fn from(reason: &str) -> Self {
        TransformError::Rejected {
            reason: reason.to_string(),
        }
    }
}

impl From<String> for TransformError {
    fn from(reason: String) -> Self {
        TransformError::Rejected { reason }
    }
}

/// Read failures of a source's transport. Interrupted or timed out reads
/// can be retried, undecodable input cannot.
impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                SourceError::Transient {
                    source: Box::new(err),
                }
            }
            ErrorKind::InvalidData => SourceError::Unrecoverable(Box::new(err)),
            _ => SourceError::Connection {
                source: Box::new(err),
            },
        }
    }
}

impl From<&str> for SinkError {
    fn from(reason: &str) -> Self {
        SinkError::Rejected {
            reason: reason.to_string(),
        }
    }
}

impl From<String> for SinkError {
    fn from(reason: String) -> Self {
        SinkError::Rejected { reason }
    }
}

impl PipelineError {
    /// Whether subscribing again (and so receiving redeliveries) can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Config(_) => false,
            PipelineError::Source(SourceError::Unrecoverable(_)) => false,
            PipelineError::Source(_) => true,
            PipelineError::Sink { .. } | PipelineError::Settlement { .. } => true,
        }
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            PipelineError::Source(_) => 1000,
            PipelineError::Sink { .. } | PipelineError::Settlement { .. } => 2000,
            _ => 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_failures_are_retryable() {
        let err = PipelineError::Sink {
            window_id: 3,
            source: SinkError::from("table locked"),
        };
        assert!(err.is_retryable());
        assert_eq!(err.get_retry_delay_ms(), 2000);
        assert_eq!(err.to_string(), "Batch sink failed for window 3");
    }

    #[test]
    fn test_config_and_unrecoverable_errors_are_not_retryable() {
        let config = PipelineError::from(ConfigError::ValidationFailed {
            reason: "max_batch_size must be positive".to_string(),
        });
        assert!(!config.is_retryable());

        let io = std::io::Error::other("broken pipe");
        let unrecoverable = PipelineError::from(SourceError::Unrecoverable(Box::new(io)));
        assert!(!unrecoverable.is_retryable());
        assert!(PipelineError::from(SourceError::Closed).is_retryable());
    }

    #[test]
    fn test_io_errors_are_classified_by_kind() {
        use std::io::{Error, ErrorKind};

        let timed_out = SourceError::from(Error::new(ErrorKind::TimedOut, "read timed out"));
        assert!(matches!(timed_out, SourceError::Transient { .. }));
        assert!(PipelineError::from(timed_out).is_retryable());

        let garbled = SourceError::from(Error::new(ErrorKind::InvalidData, "not utf-8"));
        assert!(!PipelineError::from(garbled).is_retryable());

        let reset = SourceError::from(Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(reset, SourceError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_settlement_failures_are_retryable() {
        let join_error = tokio::spawn(async { panic!("nack handle failed") })
            .await
            .unwrap_err();
        let err = PipelineError::Settlement {
            window_id: 2,
            source: join_error,
        };
        assert!(err.is_retryable());
        assert_eq!(err.get_retry_delay_ms(), 2000);
        assert_eq!(err.to_string(), "Settlement of window 2 did not finish");
    }

    #[test]
    fn test_json_errors_become_rejections() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        match TransformError::from(err) {
            TransformError::Rejected { reason } => assert!(!reason.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

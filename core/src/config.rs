use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

pub const CONFIG_ENV_VAR: &str = "RELAY_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub version: u32,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub batching: BatchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Label attached to every delivery's metadata and to log lines.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Newline-delimited payloads on standard input.
    Stdin,
}

/// Window thresholds and settlement behavior for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A window closes as soon as it holds this many attempts.
    pub max_batch_size: usize,
    /// A window closes once this much time passed since it opened, even if
    /// it is still empty.
    pub max_batch_window_ms: u64,
    /// Upper bound on a single transform; unset means a slow transform can
    /// stall its window's barrier indefinitely.
    pub transform_timeout_ms: Option<u64>,
    pub on_source_end: PartialWindowPolicy,
}

/// What happens to a partially filled window when the source completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialWindowPolicy {
    /// Close the window and settle it like any other.
    #[default]
    Flush,
    /// Drop the window without acking or nacking its messages, leaving
    /// them to the source's redelivery.
    Discard,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            max_batch_window_ms: 5000,
            transform_timeout_ms: None,
            on_source_end: PartialWindowPolicy::Flush,
        }
    }
}

impl BatchConfig {
    pub fn new(max_batch_size: usize, max_batch_window: Duration) -> Self {
        Self {
            max_batch_size,
            max_batch_window_ms: max_batch_window.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_partial_window_policy(mut self, policy: PartialWindowPolicy) -> Self {
        self.on_source_end = policy;
        self
    }

    pub fn max_batch_window(&self) -> Duration {
        Duration::from_millis(self.max_batch_window_ms)
    }

    pub fn transform_timeout(&self) -> Option<Duration> {
        self.transform_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_batch_size must be a positive integer".to_string(),
            });
        }
        if self.max_batch_window_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_batch_window_ms must be greater than zero".to_string(),
            });
        }
        if self.transform_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationFailed {
                reason: "transform_timeout_ms must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }
}

pub fn load_config(config_path: Option<&str>) -> Result<RelayConfig, ConfigError> {
    let config = match config_path {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl RelayConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(path, &content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: CONFIG_ENV_VAR.to_string(),
        })?;
        Self::from_yaml(CONFIG_ENV_VAR, &config_str)
    }

    fn from_yaml(origin: &str, content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            origin: origin.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::ValidationFailed {
                reason: format!("unsupported config version {}", self.version),
            });
        }
        if self.pipeline.name.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "Pipeline name cannot be empty".to_string(),
            });
        }
        if self.pipeline.source.name.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "Source name cannot be empty".to_string(),
            });
        }
        self.pipeline.batching.validate()
    }
}

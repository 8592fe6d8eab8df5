use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// What to requeue when the sink accepted part of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartialFailurePolicy {
    /// Requeue the whole batch. Accepted records may be written twice.
    #[default]
    RetryAll,
    /// Requeue only records the sink reported as rejected.
    /// Falls back to the whole batch when the sink cannot tell.
    RetryRejected,
}

impl FromStr for PartialFailurePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "retry-all" => Ok(PartialFailurePolicy::RetryAll),
            "retry-rejected" => Ok(PartialFailurePolicy::RetryRejected),
            other => Err(EngineError::Config(format!(
                "unknown partial failure policy '{other}' (expected retry-all or retry-rejected)"
            ))),
        }
    }
}

/// Ingestion settings owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestConfig {
    /// Topic patterns, replayed on every (re)connect.
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Flush as soon as this many records are buffered.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default)]
    pub partial_failure: PartialFailurePolicy,

    /// Write attempts for the final flush before records are reported lost.
    #[serde(default = "default_shutdown_attempts")]
    pub shutdown_attempts: u32,

    #[serde(default = "default_shutdown_retry_delay_ms")]
    pub shutdown_retry_delay_ms: u64,

    /// First buffer size that triggers a growth warning; doubles after each one.
    #[serde(default = "default_buffer_warn_threshold")]
    pub buffer_warn_threshold: usize,
}

fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_shutdown_attempts() -> u32 {
    3
}
fn default_shutdown_retry_delay_ms() -> u64 {
    1_000
}
fn default_buffer_warn_threshold() -> usize {
    10_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            partial_failure: PartialFailurePolicy::default(),
            shutdown_attempts: default_shutdown_attempts(),
            shutdown_retry_delay_ms: default_shutdown_retry_delay_ms(),
            buffer_warn_threshold: default_buffer_warn_threshold(),
        }
    }
}

impl IngestConfig {
    pub fn with_subscriptions<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscriptions: patterns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_retry_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.subscriptions.iter().all(|p| p.trim().is_empty()) {
            return Err(EngineError::Config("no topic subscriptions configured".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(EngineError::Config("flush_interval_ms must be positive".into()));
        }
        if self.shutdown_attempts == 0 {
            return Err(EngineError::Config("shutdown_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

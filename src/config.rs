//! Runtime and queue configuration.
//!
//! Both are plain serde structs. Queue configuration arrives as the opaque
//! string handed to a queue factory and is parsed as JSON.

use crate::error::{ReservoirError, Result};
use crate::queue::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing shared by every loop of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on any single blocking queue wait inside a loop
    pub poll_interval_ms: u64,
    /// Minimum spacing between pushed statistics snapshots
    pub stats_interval_ms: u64,
    /// Bound of each statistics channel
    pub stats_capacity: usize,
    /// Upper bound on the terminal statistics send
    pub final_stats_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            stats_interval_ms: 100,
            stats_capacity: 16,
            final_stats_timeout_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Parse from a JSON payload; missing fields take their defaults
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stats_capacity(mut self, capacity: usize) -> Self {
        self.stats_capacity = capacity;
        self
    }

    pub fn with_final_stats_timeout(mut self, timeout: Duration) -> Self {
        self.final_stats_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn final_stats_timeout(&self) -> Duration {
        Duration::from_millis(self.final_stats_timeout_ms)
    }

    /// Reject values that would break the liveness guarantees
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ReservoirError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.stats_capacity == 0 {
            return Err(ReservoirError::Config(
                "stats_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Construction-time queue settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `None` for an unbounded queue
    pub capacity: Option<usize>,
    /// What a put does when a bounded queue is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl QueueConfig {
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity),
            overflow,
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Parse a queue factory payload. An empty payload means an unbounded,
    /// blocking queue.
    pub fn from_json(payload: &str) -> Result<Self> {
        if payload.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == Some(0) {
            return Err(ReservoirError::Config(
                "queue capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

//! Sync configuration.
//!
//! All durations are stored in milliseconds so the structs load directly from
//! host-provided JSON; missing fields fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and backoff policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure before an operation fails.
    pub max_retries: u32,
    /// Delay before the first retry (ms).
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay (ms).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately. Useful for tests and manual drains.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Backoff before the attempt following failure number `retry_count`
    /// (1-based): `base * 2^(retry_count - 1)`, capped at `max_delay_ms`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Configuration for the sync coordinator and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix for every storage key this engine writes.
    pub namespace: String,
    /// Retry policy applied to new operations.
    pub retry: RetryPolicy,
    /// Timeout for a single remote call (ms).
    pub request_timeout_ms: u64,
    /// Period of the background drain timer (ms).
    pub sync_interval_ms: u64,
    /// Change-log size that triggers compaction.
    pub max_change_log: usize,
    /// Number of rejection messages kept for the status surface.
    pub max_reported_errors: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "tether".to_string(),
            retry: RetryPolicy::default(),
            request_timeout_ms: 30_000,
            sync_interval_ms: 60_000,
            max_change_log: 1_000,
            max_reported_errors: 50,
        }
    }
}

impl SyncConfig {
    /// Parses a config from JSON, filling omitted fields with defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Storage key of the offline queue.
    pub fn queue_key(&self) -> String {
        queue_key(&self.namespace)
    }

    /// Storage key of the change log.
    pub fn change_log_key(&self) -> String {
        change_log_key(&self.namespace)
    }

    /// Storage key of the known remote versions.
    pub fn versions_key(&self) -> String {
        versions_key(&self.namespace)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

pub(crate) fn queue_key(namespace: &str) -> String {
    format!("{namespace}:offline_queue")
}

pub(crate) fn change_log_key(namespace: &str) -> String {
    format!("{namespace}:change_log")
}

pub(crate) fn versions_key(namespace: &str) -> String {
    format!("{namespace}:known_versions")
}

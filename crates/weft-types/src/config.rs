//! Engine configuration types.
//!
//! Deserializable with serde so the settings can travel over any seam, but
//! in production they are populated from `WEFT_*` environment variables by
//! the infrastructure loader. Every field has a default so a bare
//! environment still yields a working engine.

use serde::{Deserialize, Serialize};

/// Runtime tunables for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent step consumers.
    #[serde(default = "default_step_consumers")]
    pub step_consumers: usize,
    /// Broker poll interval in milliseconds when a queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deliveries after which a message is routed to the dead-letter queue.
    #[serde(default = "default_delivery_limit")]
    pub delivery_limit: u32,
    /// How long a received message stays invisible to other consumers, in
    /// milliseconds. Must exceed the longest step timeout.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// Delay before a dependency-barrier re-enqueue, in milliseconds.
    #[serde(default = "default_barrier_requeue_delay_ms")]
    pub barrier_requeue_delay_ms: u64,
    /// Monitoring thresholds.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_consumers: default_step_consumers(),
            poll_interval_ms: default_poll_interval_ms(),
            delivery_limit: default_delivery_limit(),
            lease_ms: default_lease_ms(),
            barrier_requeue_delay_ms: default_barrier_requeue_delay_ms(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn default_step_consumers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_delivery_limit() -> u32 {
    5
}

fn default_lease_ms() -> u64 {
    60_000
}

fn default_barrier_requeue_delay_ms() -> u64 {
    1_000
}

/// Alert thresholds for the execution monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Error-rate threshold in `[0, 1]` over the recent window.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Retry-rate threshold in `[0, 1]` over the recent window.
    #[serde(default = "default_retry_rate_threshold")]
    pub retry_rate_threshold: f64,
    /// Execution duration threshold in milliseconds.
    #[serde(default = "default_duration_threshold_ms")]
    pub duration_threshold_ms: u64,
    /// Length of the recent-error window in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: default_error_rate_threshold(),
            retry_rate_threshold: default_retry_rate_threshold(),
            duration_threshold_ms: default_duration_threshold_ms(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_error_rate_threshold() -> f64 {
    0.25
}

fn default_retry_rate_threshold() -> f64 {
    0.5
}

fn default_duration_threshold_ms() -> u64 {
    300_000
}

fn default_window_secs() -> u64 {
    300
}

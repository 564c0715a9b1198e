//! Tunables for the realtime layer.
//!
//! The core never reads the environment itself; the composition root builds
//! a [`RealtimeConfig`] (usually starting from [`Default`]) and hands it in.

use std::time::Duration;

use prayermap_shared::constants::*;

/// Realtime layer configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// A map update slower than this is a hard compliance violation.
    pub map_update_budget: Duration,

    /// Message latency above this ceiling activates throttling.
    pub message_latency_ceiling: Duration,

    /// Whether map updates may switch messaging into throttled mode.
    pub throttling_enabled: bool,

    /// How long a throttling window lasts before normal mode resumes.
    pub throttle_window: Duration,

    /// Realtime bandwidth budget in bytes per second.
    pub bandwidth_limit_bytes: u64,

    /// Estimated wire size of a single chat message.
    pub message_size_estimate: u64,

    /// Soft cap on the deferred message queue.
    pub message_queue_cap: usize,

    /// Cadence of the resource utilization recomputation.
    pub utilization_interval: Duration,

    /// Cadence of the full metrics snapshot and compliance check.
    pub metrics_interval: Duration,

    /// Delay before a degraded-mode background flush runs.
    pub idle_flush_delay: Duration,

    /// Base presence heartbeat interval.
    pub heartbeat_base: Duration,

    /// Battery level below which the heartbeat slows down.
    pub low_battery_threshold: f32,

    /// First memorial retry delay.
    pub memorial_retry_initial: Duration,

    /// Delay between subsequent memorial retries.
    pub memorial_retry_steady: Duration,

    /// Cadence of the memorial integrity self-check.
    pub integrity_check_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            map_update_budget: Duration::from_millis(MAP_UPDATE_BUDGET_MS),
            message_latency_ceiling: Duration::from_millis(MESSAGE_LATENCY_CEILING_MS),
            throttling_enabled: true,
            throttle_window: Duration::from_secs(THROTTLE_WINDOW_SECS),
            bandwidth_limit_bytes: DEFAULT_BANDWIDTH_LIMIT_BYTES,
            message_size_estimate: MESSAGE_SIZE_ESTIMATE_BYTES,
            message_queue_cap: MESSAGE_QUEUE_SOFT_CAP,
            utilization_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(5),
            idle_flush_delay: Duration::from_millis(100),
            heartbeat_base: Duration::from_secs(HEARTBEAT_BASE_SECS),
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
            memorial_retry_initial: Duration::from_millis(MEMORIAL_RETRY_INITIAL_MS),
            memorial_retry_steady: Duration::from_millis(MEMORIAL_RETRY_STEADY_MS),
            integrity_check_interval: Duration::from_secs(60),
        }
    }
}

/// Application name
pub const APP_NAME: &str = "PrayerMap";

/// A map update must reach the shared map within this many milliseconds.
pub const MAP_UPDATE_BUDGET_MS: u64 = 2_000;

/// Message latency above this ceiling activates throttling (milliseconds).
pub const MESSAGE_LATENCY_CEILING_MS: u64 = 5_000;

/// Length of a throttling window in seconds.
pub const THROTTLE_WINDOW_SECS: u64 = 30;

/// Default realtime bandwidth budget in bytes per second (100 KiB/s).
pub const DEFAULT_BANDWIDTH_LIMIT_BYTES: u64 = 100 * 1024;

/// Width of the bandwidth sampling window in milliseconds.
pub const BANDWIDTH_WINDOW_MS: u64 = 1_000;

/// Fraction of the budget at which bandwidth counts as "approaching" the limit.
pub const BANDWIDTH_WARNING_RATIO: f64 = 0.8;

/// Estimated wire size of one chat message in bytes.
pub const MESSAGE_SIZE_ESTIMATE_BYTES: u64 = 1_024;

/// Soft cap on the deferred message queue.
pub const MESSAGE_QUEUE_SOFT_CAP: usize = 100;

/// MapUpdate allocation at or above this percentage denies messaging.
pub const MAP_UPDATE_BUSY_THRESHOLD_PCT: u8 = 80;

/// Resource utilization above this percentage defers messaging.
pub const MESSAGING_DEFER_UTILIZATION_PCT: f64 = 85.0;

/// Resource utilization above this percentage is a compliance warning.
pub const UTILIZATION_WARNING_PCT: f64 = 90.0;

/// Base presence heartbeat interval in seconds.
pub const HEARTBEAT_BASE_SECS: u64 = 30;

/// Battery level (0.0-1.0) below which the heartbeat slows down.
pub const LOW_BATTERY_THRESHOLD: f32 = 0.2;

/// First memorial retry delay in milliseconds.
pub const MEMORIAL_RETRY_INITIAL_MS: u64 = 1_000;

/// Steady-state memorial retry delay in milliseconds.
pub const MEMORIAL_RETRY_STEADY_MS: u64 = 5_000;

/// Priority weights used for allocation tie-breaks.
pub const WEIGHT_MAP_UPDATE: u8 = 100;
pub const WEIGHT_MEMORIAL_LINE: u8 = 95;
pub const WEIGHT_MESSAGING: u8 = 60;
pub const WEIGHT_BACKGROUND_SYNC: u8 = 30;

/// Realtime event names as they appear on the wire.
pub const EVENT_MAP_UPDATE: &str = "map-update";
pub const EVENT_MEMORIAL_LINE_CREATED: &str = "memorial-line-created";
pub const EVENT_PRESENCE_CHANGED: &str = "presence-changed";
pub const EVENT_ACTIVE_TASK_STARTED: &str = "active-task-started";
pub const EVENT_CHAT_MESSAGE: &str = "chat-message";

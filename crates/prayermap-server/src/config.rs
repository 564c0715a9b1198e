//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use prayermap_realtime::RealtimeConfig;
use prayermap_shared::constants::{
    DEFAULT_BANDWIDTH_LIMIT_BYTES, MESSAGE_LATENCY_CEILING_MS, MESSAGE_QUEUE_SOFT_CAP,
};
use prayermap_shared::{DeviceId, UserId};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`. Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`. Default: `./prayermap.db`
    pub database_path: PathBuf,

    /// User whose presence this node tracks. Presence tracking is off when unset.
    /// Env: `TRACKED_USER_ID`
    pub tracked_user_id: Option<UserId>,

    /// Env: `DEVICE_ID`. Default: a fresh UUID per process.
    pub device_id: DeviceId,

    /// Bearer token for `/admin/*`. Admin API disabled when unset.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,

    /// Env: `BANDWIDTH_LIMIT_BYTES`
    pub bandwidth_limit_bytes: u64,

    /// Env: `MESSAGE_LATENCY_CEILING_MS`
    pub message_latency_ceiling: Duration,

    /// Env: `MESSAGE_QUEUE_CAP`
    pub message_queue_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./prayermap.db"),
            tracked_user_id: None,
            device_id: DeviceId::generate(),
            admin_token: None,
            bandwidth_limit_bytes: DEFAULT_BANDWIDTH_LIMIT_BYTES,
            message_latency_ceiling: Duration::from_millis(MESSAGE_LATENCY_CEILING_MS),
            message_queue_cap: MESSAGE_QUEUE_SOFT_CAP,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup, falling back to defaults on
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(user) = lookup("TRACKED_USER_ID") {
            match UserId::new(user) {
                Ok(user) => config.tracked_user_id = Some(user),
                Err(e) => tracing::warn!(error = %e, "Invalid TRACKED_USER_ID, presence tracking off"),
            }
        }

        if let Some(device) = lookup("DEVICE_ID").filter(|d| !d.trim().is_empty()) {
            config.device_id = DeviceId(device);
        }

        if let Some(token) = lookup("ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            config.admin_token = Some(token);
        }

        if let Some(limit) = parse_number::<u64>(&lookup, "BANDWIDTH_LIMIT_BYTES") {
            config.bandwidth_limit_bytes = limit;
        }

        if let Some(ms) = parse_number::<u64>(&lookup, "MESSAGE_LATENCY_CEILING_MS") {
            config.message_latency_ceiling = Duration::from_millis(ms);
        }

        if let Some(cap) = parse_number::<usize>(&lookup, "MESSAGE_QUEUE_CAP") {
            config.message_queue_cap = cap;
        }

        config
    }

    /// Tunables handed to the realtime core.
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            bandwidth_limit_bytes: self.bandwidth_limit_bytes,
            message_latency_ceiling: self.message_latency_ceiling,
            message_queue_cap: self.message_queue_cap,
            ..RealtimeConfig::default()
        }
    }
}

fn parse_number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}

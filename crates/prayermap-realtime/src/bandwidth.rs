//! Rolling one-second bandwidth accounting.
//!
//! Every transfer is recorded as a timestamped sample. Usage is the sum of
//! samples inside the trailing window; older samples are pruned before each
//! computation.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use prayermap_shared::constants::{BANDWIDTH_WARNING_RATIO, BANDWIDTH_WINDOW_MS};

/// Aggressive monitoring never tightens the limit below `base / LIMIT_FLOOR_DIVISOR`.
const LIMIT_FLOOR_DIVISOR: u64 = 8;

#[derive(Debug, Clone, Copy)]
struct BandwidthSample {
    at: Instant,
    bytes: u64,
}

/// Snapshot of the monitor for status reporting.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct BandwidthStatus {
    pub current_usage: u64,
    pub limit: u64,
    pub over_limit: bool,
    pub approaching_limit: bool,
}

#[derive(Debug, Clone)]
pub struct BandwidthMonitor {
    samples: VecDeque<BandwidthSample>,
    window: Duration,
    base_limit: u64,
    limit: u64,
    current_usage: u64,
}

impl BandwidthMonitor {
    /// Create a monitor with a budget of `limit` bytes per second.
    pub fn new(limit: u64) -> Self {
        Self {
            samples: VecDeque::new(),
            window: Duration::from_millis(BANDWIDTH_WINDOW_MS),
            base_limit: limit,
            limit,
            current_usage: 0,
        }
    }

    pub fn record_transfer(&mut self, bytes: u64) {
        self.record_transfer_at(bytes, Instant::now());
    }

    pub fn record_transfer_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(BandwidthSample { at: now, bytes });
        self.recompute(now);
        debug!(bytes, usage = self.current_usage, "Recorded transfer");
    }

    /// Bytes transferred within the trailing window.
    pub fn current_usage(&mut self) -> u64 {
        self.current_usage_at(Instant::now())
    }

    pub fn current_usage_at(&mut self, now: Instant) -> u64 {
        self.recompute(now);
        self.current_usage
    }

    pub fn is_over_limit(&mut self) -> bool {
        self.current_usage() > self.limit
    }

    pub fn is_approaching_limit(&mut self) -> bool {
        self.current_usage() as f64 > self.limit as f64 * BANDWIDTH_WARNING_RATIO
    }

    /// Halve the effective limit.
    ///
    /// Repeated calls compound, but the limit never drops below an eighth
    /// of the configured budget.
    pub fn enable_aggressive_monitoring(&mut self) {
        let floor = (self.base_limit / LIMIT_FLOOR_DIVISOR).max(1);
        let tightened = (self.limit / 2).max(floor);
        if tightened != self.limit {
            warn!(
                previous = self.limit,
                limit = tightened,
                "Aggressive bandwidth monitoring enabled"
            );
        }
        self.limit = tightened;
    }

    /// Return to the configured budget.
    pub fn restore_limit(&mut self) {
        if self.limit != self.base_limit {
            debug!(limit = self.base_limit, "Bandwidth limit restored");
        }
        self.limit = self.base_limit;
    }

    pub fn effective_limit(&self) -> u64 {
        self.limit
    }

    pub fn base_limit(&self) -> u64 {
        self.base_limit
    }

    /// Current usage as a fraction of the effective limit (may exceed 1.0).
    pub fn utilization_ratio(&mut self) -> f64 {
        let usage = self.current_usage();
        if self.limit == 0 {
            return 0.0;
        }
        usage as f64 / self.limit as f64
    }

    pub fn status(&mut self) -> BandwidthStatus {
        let current_usage = self.current_usage();
        BandwidthStatus {
            current_usage,
            limit: self.limit,
            over_limit: current_usage > self.limit,
            approaching_limit: current_usage as f64 > self.limit as f64 * BANDWIDTH_WARNING_RATIO,
        }
    }

    fn recompute(&mut self, now: Instant) {
        while let Some(oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest.at) < self.window {
                break;
            }
            self.samples.pop_front();
        }
        self.current_usage = self.samples.iter().map(|s| s.bytes).sum();
    }
}

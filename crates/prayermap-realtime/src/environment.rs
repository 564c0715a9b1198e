//! Platform signals that shape presence.
//!
//! Connectivity, visibility, foreground/background and battery state come
//! from the host platform. The presence tracker only sees them through
//! [`EnvironmentSource`], so tests can drive them by hand.

use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::lock;

/// A single push-style change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnvironmentSignal {
    Connectivity { online: bool },
    Visibility { hidden: bool },
    AppState { foreground: bool },
    /// Battery level in `0.0..=1.0`.
    Battery { level: f32 },
    /// The process or page is being torn down.
    Terminating,
}

/// Point-in-time view of the environment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentSnapshot {
    pub online: bool,
    pub hidden: bool,
    pub foreground: bool,
    /// `None` when the platform exposes no battery information.
    pub battery_level: Option<f32>,
}

impl EnvironmentSnapshot {
    /// Hidden pages and backgrounded apps both count as background.
    pub fn is_background(&self) -> bool {
        self.hidden || !self.foreground
    }

    pub fn is_low_battery(&self, threshold: f32) -> bool {
        self.battery_level.map(|level| level < threshold).unwrap_or(false)
    }

    /// Fold a signal into the snapshot.
    pub fn apply(&mut self, signal: EnvironmentSignal) {
        match signal {
            EnvironmentSignal::Connectivity { online } => self.online = online,
            EnvironmentSignal::Visibility { hidden } => self.hidden = hidden,
            EnvironmentSignal::AppState { foreground } => self.foreground = foreground,
            EnvironmentSignal::Battery { level } => self.battery_level = Some(level),
            EnvironmentSignal::Terminating => {}
        }
    }
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self {
            online: true,
            hidden: false,
            foreground: true,
            battery_level: None,
        }
    }
}

pub trait EnvironmentSource: Send + Sync {
    fn snapshot(&self) -> EnvironmentSnapshot;

    /// Stream of signals emitted after the call.
    fn subscribe(&self) -> broadcast::Receiver<EnvironmentSignal>;
}

/// An environment driven explicitly by its owner.
///
/// Used by tests and by headless deployments where the process is always
/// "foreground".
pub struct ManualEnvironment {
    snapshot: Mutex<EnvironmentSnapshot>,
    signals: broadcast::Sender<EnvironmentSignal>,
}

impl ManualEnvironment {
    pub fn new() -> Self {
        Self::with_snapshot(EnvironmentSnapshot::default())
    }

    pub fn with_snapshot(snapshot: EnvironmentSnapshot) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            snapshot: Mutex::new(snapshot),
            signals,
        }
    }

    /// Apply a signal and push it to subscribers.
    pub fn emit(&self, signal: EnvironmentSignal) {
        lock(&self.snapshot).apply(signal);
        // No receivers is fine: nothing is tracking presence yet.
        if self.signals.send(signal).is_err() {
            debug!(?signal, "Environment signal emitted without subscribers");
        }
    }

    pub fn set_online(&self, online: bool) {
        self.emit(EnvironmentSignal::Connectivity { online });
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.emit(EnvironmentSignal::Visibility { hidden });
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.emit(EnvironmentSignal::AppState { foreground });
    }

    pub fn set_battery_level(&self, level: f32) {
        self.emit(EnvironmentSignal::Battery { level });
    }

    pub fn terminate(&self) {
        self.emit(EnvironmentSignal::Terminating);
    }
}

impl Default for ManualEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentSource for ManualEnvironment {
    fn snapshot(&self) -> EnvironmentSnapshot {
        *lock(&self.snapshot)
    }

    fn subscribe(&self) -> broadcast::Receiver<EnvironmentSignal> {
        self.signals.subscribe()
    }
}

//! # prayermap-realtime
//!
//! Priority arbitration and resource throttling for the PrayerMap realtime
//! channel.
//!
//! Three kinds of traffic share one channel:
//! - **Map updates** always preempt everything else and must land within
//!   two seconds
//! - **Memorial lines** are never lost; failed writes retry until they stick
//! - **Chat messages** are deferred under load and flushed later, with a
//!   bounded, lossy queue
//!
//! Presence runs beside them on its own adaptive heartbeat.

pub mod allocator;
pub mod bandwidth;
pub mod channel;
pub mod config;
pub mod environment;
pub mod living_map;
pub mod memorial;
pub mod presence;
pub mod store;

mod error;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use allocator::ResourceAllocator;
pub use bandwidth::{BandwidthMonitor, BandwidthStatus};
pub use channel::MessagingChannel;
pub use config::RealtimeConfig;
pub use environment::{EnvironmentSignal, EnvironmentSnapshot, EnvironmentSource, ManualEnvironment};
pub use error::{RealtimeError, Result};
pub use living_map::{DeliveryOutcome, LivingMap, LivingMapStatus, PerformanceMetrics};
pub use memorial::{IntegrityStatus, MemorialProtector, MemorialStatus};
pub use presence::PresenceTracker;
pub use store::DurableStore;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

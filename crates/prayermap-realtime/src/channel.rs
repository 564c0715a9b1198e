//! The realtime transport seam.
//!
//! Subscribe/publish mechanics belong to the transport. This crate only
//! sends events and toggles efficient mode while traffic is throttled.

use async_trait::async_trait;

use prayermap_shared::RealtimeEvent;

use crate::error::Result;

#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Reduce update frequency while higher-priority traffic needs room.
    fn enable_efficient_mode(&self);

    /// Restore normal update frequency.
    fn disable_efficient_mode(&self);

    /// Publish an event to every subscriber of the shared channel.
    async fn send(&self, event: RealtimeEvent) -> Result<()>;
}

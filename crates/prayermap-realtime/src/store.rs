//! The durable store contract.
//!
//! Memorial lines, presence rows and aggregate presence statistics live in
//! an external store. Any call may fail; only memorial-line creation is
//! retried by this crate.

use async_trait::async_trait;

use prayermap_shared::{DeviceId, OnlineStats, PrayerConnection, PresenceRecord, UserId};

use crate::error::Result;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Durably create a prayer connection. Creating an id that already
    /// exists must succeed without producing a duplicate.
    async fn create_connection(&self, connection: &PrayerConnection) -> Result<()>;

    /// Insert or replace the presence row for `record.user_id`.
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<()>;

    async fn fetch_presence(&self, user_id: &UserId) -> Result<Option<PresenceRecord>>;

    async fn online_stats(&self) -> Result<OnlineStats>;

    /// Fire-and-forget offline write used during teardown.
    ///
    /// Must not block; receipt is not confirmed.
    fn send_offline_beacon(&self, user_id: &UserId, device_id: &DeviceId);
}

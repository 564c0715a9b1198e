//! [`DurableStore`] backed by the SQLite [`Database`].
//!
//! rusqlite is synchronous, so every call hops onto the blocking pool.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use prayermap_realtime::{DurableStore, RealtimeError, Result};
use prayermap_shared::{DeviceId, OnlineStats, PrayerConnection, PresenceRecord, UserId};
use prayermap_store::{Database, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn count_connections(&self) -> Result<u64> {
        self.run(|db| db.count_connections()).await
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            op(&guard)
        })
        .await
        .map_err(|e| RealtimeError::Store(format!("blocking task failed: {e}")))?
        .map_err(|e| RealtimeError::Store(e.to_string()))
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn create_connection(&self, connection: &PrayerConnection) -> Result<()> {
        let connection = connection.clone();
        let id = connection.id;
        let inserted = self.run(move |db| db.insert_connection(&connection)).await?;
        if !inserted {
            debug!(connection = %id, "Memorial line already stored");
        }
        Ok(())
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<()> {
        let record = record.clone();
        self.run(move |db| db.upsert_presence(&record)).await
    }

    async fn fetch_presence(&self, user_id: &UserId) -> Result<Option<PresenceRecord>> {
        let user_id = user_id.clone();
        self.run(move |db| db.get_presence(&user_id)).await
    }

    async fn online_stats(&self) -> Result<OnlineStats> {
        self.run(|db| db.online_stats()).await
    }

    fn send_offline_beacon(&self, user_id: &UserId, device_id: &DeviceId) {
        let db = self.db.clone();
        let user_id = user_id.clone();
        let device_id = device_id.clone();
        let beacon = move || {
            let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = guard.mark_offline(&user_id, &device_id) {
                warn!(user = %user_id, error = %e, "Offline beacon failed");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(beacon);
            }
            Err(_) => beacon(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prayermap_shared::{ConnectionId, GeoPoint, PrayerId, PresenceStatus};

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("adapter.db")).unwrap();
        (dir, SqliteStore::new(db))
    }

    fn line() -> PrayerConnection {
        PrayerConnection {
            id: ConnectionId::new(),
            prayer_id: PrayerId::new(),
            requester_id: UserId::new("ana").unwrap(),
            responder_id: UserId::new("ben").unwrap(),
            requester_location: GeoPoint::new(10.0, 10.0).unwrap(),
            responder_location: GeoPoint::new(20.0, 20.0).unwrap(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_connection_is_idempotent() {
        let (_dir, store) = store();
        let conn = line();

        store.create_connection(&conn).await.unwrap();
        store.create_connection(&conn).await.unwrap();

        assert_eq!(store.count_connections().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_presence_round_trip_and_beacon() {
        let (_dir, store) = store();
        let record = PresenceRecord {
            user_id: UserId::new("ana").unwrap(),
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            custom_status: None,
            active_task_ids: Vec::new(),
            device_id: DeviceId("phone".into()),
            connection_count: 1,
        };
        store.upsert_presence(&record).await.unwrap();
        assert_eq!(store.online_stats().await.unwrap().online_count, 1);

        store.send_offline_beacon(&record.user_id, &record.device_id);
        for _ in 0..50 {
            let stats = store.online_stats().await.unwrap();
            if stats.online_count == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let stored = store.fetch_presence(&record.user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Offline);
    }
}

//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use prayermap_realtime::{
    DurableStore, LivingMap, ManualEnvironment, MessagingChannel, PresenceTracker, RealtimeConfig,
    RealtimeError, Result,
};
use prayermap_shared::{
    ChatMessage, ConnectionId, ConversationId, DeviceId, GeoPoint, MapUpdate, MapUpdateKind,
    MessageId, OnlineStats, PrayerConnection, PrayerId, PresenceRecord, PresenceStatus,
    RealtimeEvent, UserId,
};

/// Store that fails the first `failures` connection writes.
#[derive(Default)]
pub struct FakeStore {
    pub failures: AtomicU32,
    pub connection_writes: AtomicU32,
    pub connections: Mutex<HashMap<ConnectionId, PrayerConnection>>,
    pub presence: Mutex<HashMap<UserId, PresenceRecord>>,
    pub presence_writes: Mutex<Vec<PresenceRecord>>,
    pub beacons: Mutex<Vec<UserId>>,
}

impl FakeStore {
    pub fn failing(failures: u32) -> Self {
        let store = Self::default();
        store.failures.store(failures, Ordering::SeqCst);
        store
    }
}

#[async_trait]
impl DurableStore for FakeStore {
    async fn create_connection(&self, connection: &PrayerConnection) -> Result<()> {
        self.connection_writes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RealtimeError::Store("database is locked".into()));
        }
        self.connections
            .lock()
            .unwrap()
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<()> {
        self.presence_writes.lock().unwrap().push(record.clone());
        self.presence
            .lock()
            .unwrap()
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn fetch_presence(&self, user_id: &UserId) -> Result<Option<PresenceRecord>> {
        Ok(self.presence.lock().unwrap().get(user_id).cloned())
    }

    async fn online_stats(&self) -> Result<OnlineStats> {
        let presence = self.presence.lock().unwrap();
        let mut stats = OnlineStats::default();
        for record in presence.values() {
            match record.status {
                PresenceStatus::Online => stats.online_count += 1,
                PresenceStatus::ActiveTask => stats.active_task_count += 1,
                PresenceStatus::Away => stats.away_count += 1,
                PresenceStatus::Offline => {}
            }
        }
        Ok(stats)
    }

    fn send_offline_beacon(&self, user_id: &UserId, _device_id: &DeviceId) {
        self.beacons.lock().unwrap().push(user_id.clone());
    }
}

/// One event as seen by the channel, stamped when the send completed.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub event: RealtimeEvent,
    pub at: Instant,
}

/// Channel with configurable per-class latency.
///
/// It also checks the arbitration invariant from the transport's side: a
/// chat send must never start while a map update send is in progress.
#[derive(Default)]
pub struct FakeChannel {
    pub map_delay: Mutex<Duration>,
    pub chat_delay: Mutex<Duration>,
    pub efficient: AtomicBool,
    pub delivered: Mutex<Vec<Delivered>>,
    active_map_sends: AtomicUsize,
    pub chat_during_map_update: AtomicUsize,
}

impl FakeChannel {
    pub fn with_map_delay(delay: Duration) -> Self {
        let channel = Self::default();
        *channel.map_delay.lock().unwrap() = delay;
        channel
    }

    pub fn events(&self) -> Vec<RealtimeEvent> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.event.clone())
            .collect()
    }

    pub fn chat_ids(&self) -> Vec<MessageId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RealtimeEvent::ChatMessage(m) => Some(m.id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessagingChannel for FakeChannel {
    fn enable_efficient_mode(&self) {
        self.efficient.store(true, Ordering::SeqCst);
    }

    fn disable_efficient_mode(&self) {
        self.efficient.store(false, Ordering::SeqCst);
    }

    async fn send(&self, event: RealtimeEvent) -> Result<()> {
        match &event {
            RealtimeEvent::MapUpdate(_) => {
                self.active_map_sends.fetch_add(1, Ordering::SeqCst);
                let delay = *self.map_delay.lock().unwrap();
                tokio::time::sleep(delay).await;
                self.active_map_sends.fetch_sub(1, Ordering::SeqCst);
            }
            RealtimeEvent::ChatMessage(_) => {
                if self.active_map_sends.load(Ordering::SeqCst) > 0 {
                    self.chat_during_map_update.fetch_add(1, Ordering::SeqCst);
                }
                let delay = *self.chat_delay.lock().unwrap();
                tokio::time::sleep(delay).await;
            }
            _ => {}
        }

        self.delivered.lock().unwrap().push(Delivered {
            event,
            at: Instant::now(),
        });
        Ok(())
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

pub fn map_update() -> MapUpdate {
    MapUpdate {
        prayer_id: PrayerId::new(),
        kind: MapUpdateKind::PrayerPosted,
        location: GeoPoint::new(40.71, -74.0).unwrap(),
        actor_id: user("poster"),
        connection_id: None,
        occurred_at: Utc::now(),
    }
}

pub fn chat(body: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(),
        conversation_id: ConversationId::new(),
        sender_id: user("sender"),
        body: body.to_string(),
        sent_at: Utc::now(),
    }
}

pub fn memorial_line() -> PrayerConnection {
    PrayerConnection {
        id: ConnectionId::new(),
        prayer_id: PrayerId::new(),
        requester_id: user("requester"),
        responder_id: user("responder"),
        requester_location: GeoPoint::new(51.5, -0.12).unwrap(),
        responder_location: GeoPoint::new(48.85, 2.35).unwrap(),
        created_at: Utc::now(),
        expires_at: None,
    }
}

pub struct Harness {
    pub map: LivingMap,
    pub store: Arc<FakeStore>,
    pub channel: Arc<FakeChannel>,
}

pub fn harness(store: FakeStore, channel: FakeChannel) -> Harness {
    let store = Arc::new(store);
    let channel = Arc::new(channel);
    let map = LivingMap::new(
        RealtimeConfig::default(),
        store.clone(),
        channel.clone(),
        None,
    );
    Harness {
        map,
        store,
        channel,
    }
}

pub fn presence_tracker(
    store: Arc<FakeStore>,
    channel: Arc<FakeChannel>,
) -> (PresenceTracker, Arc<ManualEnvironment>) {
    let environment = Arc::new(ManualEnvironment::new());
    let tracker = PresenceTracker::new(
        store,
        channel,
        environment.clone(),
        DeviceId("device-under-test".into()),
        &RealtimeConfig::default(),
    );
    (tracker, environment)
}

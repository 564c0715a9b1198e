use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    EVENT_ACTIVE_TASK_STARTED, EVENT_CHAT_MESSAGE, EVENT_MAP_UPDATE, EVENT_MEMORIAL_LINE_CREATED,
    EVENT_PRESENCE_CHANGED,
};
use crate::types::{
    ConnectionId, ConversationId, DeviceId, GeoPoint, MessageId, PrayerId, PresenceStatus, UserId,
};

/// A prayer connection drawn on the map as a memorial line.
///
/// Once created it is permanent as far as the realtime layer is concerned.
/// `expires_at` is a display hint for the map renderer, never a deletion
/// trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrayerConnection {
    pub id: ConnectionId,
    pub prayer_id: PrayerId,
    pub requester_id: UserId,
    pub responder_id: UserId,
    pub requester_location: GeoPoint,
    pub responder_location: GeoPoint,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MapUpdateKind {
    PrayerPosted,
    PrayerResponded,
    ConnectionCreated,
    PrayerRemoved,
}

/// A change that must show up on every viewer's map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapUpdate {
    pub prayer_id: PrayerId,
    pub kind: MapUpdateKind,
    pub location: GeoPoint,
    pub actor_id: UserId,
    /// Set when the update stems from a prayer response that produced a connection.
    pub connection_id: Option<ConnectionId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Current presence of one user on one device. Last write wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub custom_status: Option<String>,
    #[serde(default)]
    pub active_task_ids: Vec<PrayerId>,
    pub device_id: DeviceId,
    pub connection_count: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineStats {
    pub online_count: u64,
    pub active_task_count: u64,
    pub away_count: u64,
}

/// Everything that travels over the shared realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum RealtimeEvent {
    MapUpdate(MapUpdate),
    MemorialLineCreated(PrayerConnection),
    /// Routine presence churn (online / away / offline).
    PresenceChanged(PresenceRecord),
    /// A user started actively engaging with prayers.
    ActiveTaskStarted(PresenceRecord),
    ChatMessage(ChatMessage),
}

impl RealtimeEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            RealtimeEvent::MapUpdate(_) => EVENT_MAP_UPDATE,
            RealtimeEvent::MemorialLineCreated(_) => EVENT_MEMORIAL_LINE_CREATED,
            RealtimeEvent::PresenceChanged(_) => EVENT_PRESENCE_CHANGED,
            RealtimeEvent::ActiveTaskStarted(_) => EVENT_ACTIVE_TASK_STARTED,
            RealtimeEvent::ChatMessage(_) => EVENT_CHAT_MESSAGE,
        }
    }

    /// Build the presence delta for a record, picking the active-task variant
    /// when appropriate.
    pub fn presence_delta(record: PresenceRecord) -> Self {
        if record.status == PresenceStatus::ActiveTask {
            RealtimeEvent::ActiveTaskStarted(record)
        } else {
            RealtimeEvent::PresenceChanged(record)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

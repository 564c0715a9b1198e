use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    WEIGHT_BACKGROUND_SYNC, WEIGHT_MAP_UPDATE, WEIGHT_MEMORIAL_LINE, WEIGHT_MESSAGING,
};
use crate::error::PrayerMapError;

// User identity = opaque auth subject handed to us by the session layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, PrayerMapError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PrayerMapError::EmptyUserId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = PrayerMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifies one device of a user, so multi-device presence can be told apart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// A prayer request pinned on the map.
    PrayerId
);
uuid_id!(
    /// A prayer connection, i.e. a memorial line between requester and responder.
    ConnectionId
);
uuid_id!(MessageId);
uuid_id!(ConversationId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Result<Self, PrayerMapError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(PrayerMapError::InvalidCoordinates { lat, lng });
        }
        Ok(Self { lat, lng })
    }
}

/// Traffic classes competing for the shared realtime channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    MapUpdate,
    MemorialLine,
    Messaging,
    BackgroundSync,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::MapUpdate,
        PriorityClass::MemorialLine,
        PriorityClass::Messaging,
        PriorityClass::BackgroundSync,
    ];

    /// Fixed weight; strictly decreasing in declaration order.
    pub fn weight(self) -> u8 {
        match self {
            PriorityClass::MapUpdate => WEIGHT_MAP_UPDATE,
            PriorityClass::MemorialLine => WEIGHT_MEMORIAL_LINE,
            PriorityClass::Messaging => WEIGHT_MESSAGING,
            PriorityClass::BackgroundSync => WEIGHT_BACKGROUND_SYNC,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::MapUpdate => "map_update",
            PriorityClass::MemorialLine => "memorial_line",
            PriorityClass::Messaging => "messaging",
            PriorityClass::BackgroundSync => "background_sync",
        }
    }

    /// Classes that may be reclaimed when the system falls out of compliance.
    pub fn is_non_critical(self) -> bool {
        matches!(self, PriorityClass::Messaging | PriorityClass::BackgroundSync)
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = PrayerMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PriorityClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| PrayerMapError::UnknownPriorityClass(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
    /// Actively engaged with one or more prayers.
    ActiveTask,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
            PresenceStatus::ActiveTask => "active_task",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = PrayerMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "offline" => Ok(PresenceStatus::Offline),
            "active_task" => Ok(PresenceStatus::ActiveTask),
            other => Err(PrayerMapError::UnknownPresenceStatus(other.to_string())),
        }
    }
}

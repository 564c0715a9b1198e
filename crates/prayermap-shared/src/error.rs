use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrayerMapError {
    #[error("User id must not be empty")]
    EmptyUserId,

    #[error("Unknown presence status: {0}")]
    UnknownPresenceStatus(String),

    #[error("Unknown priority class: {0}")]
    UnknownPriorityClass(String),

    #[error("Invalid coordinates: lat {lat}, lng {lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },
}

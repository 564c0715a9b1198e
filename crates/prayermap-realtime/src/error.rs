use thiserror::Error;

use prayermap_shared::ConnectionId;

/// Errors surfaced by the realtime layer and its collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// The durable store rejected or failed an operation.
    #[error("Durable store error: {0}")]
    Store(String),

    /// The realtime transport failed to deliver an event.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A memorial line write failed; a retry has already been scheduled.
    #[error("Memorial line {id} not yet preserved: {reason}")]
    MemorialPending { id: ConnectionId, reason: String },

    /// A map update could not be applied.
    #[error("Map update failed: {0}")]
    MapUpdate(String),

    /// An event could not be encoded for the wire.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RealtimeError>;

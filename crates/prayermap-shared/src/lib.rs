//! # prayermap-shared
//!
//! Domain types shared by every PrayerMap crate: identifiers, priority
//! classes, presence states, the memorial-line record and the tagged
//! realtime event carried over the shared channel.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::PrayerMapError;
pub use protocol::*;
pub use types::*;

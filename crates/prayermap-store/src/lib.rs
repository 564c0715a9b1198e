//! # prayermap-store
//!
//! Durable storage for the PrayerMap realtime core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for the two tables the realtime
//! layer writes to: `prayer_connections` (memorial lines) and
//! `user_presence`. Memorial lines are insert-only; nothing in this crate
//! deletes them.

pub mod connections;
pub mod database;
pub mod migrations;
pub mod presence;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};

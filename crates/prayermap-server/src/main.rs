//! # prayermap-server
//!
//! Composition root for the PrayerMap realtime core.
//!
//! This binary wires:
//! - the **SQLite store** behind the durable-store contract
//! - an in-process **event hub** as the realtime channel
//! - the **living-map arbiter** with its monitors and memorial protector
//! - optional **presence tracking** for one user on this device
//! - a small **REST API** (axum) for ingest, status and admin

mod api;
mod config;
mod error;
mod hub;
mod store_adapter;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use prayermap_realtime::{LivingMap, ManualEnvironment, PresenceTracker};
use prayermap_shared::PresenceStatus;
use prayermap_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::EventHub;
use crate::store_adapter::SqliteStore;

const HUB_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing (respects RUST_LOG)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,prayermap_server=debug,prayermap_realtime=debug")
        }))
        .init();

    info!("Starting PrayerMap realtime server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        device = %config.device_id,
        tracked_user = ?config.tracked_user_id,
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );
    let realtime_config = config.realtime_config();

    // -----------------------------------------------------------------------
    // 3. Subsystems
    // -----------------------------------------------------------------------
    let store = Arc::new(SqliteStore::new(Database::open_at(&config.database_path)?));
    let hub = EventHub::new(HUB_CAPACITY);
    let channel = Arc::new(hub.clone());
    let environment = Arc::new(ManualEnvironment::new());

    let presence = PresenceTracker::new(
        store.clone(),
        channel.clone(),
        environment,
        config.device_id.clone(),
        &realtime_config,
    );
    let living_map = LivingMap::new(realtime_config, store, channel, Some(presence.clone()));
    living_map.start();

    if let Some(user) = config.tracked_user_id.clone() {
        presence
            .start_presence_tracking(user, PresenceStatus::Online, None)
            .await;
    }

    // -----------------------------------------------------------------------
    // 4. Background tasks
    // -----------------------------------------------------------------------

    // Feed presence from other devices back into the local cache.
    let mut events = hub.subscribe();
    let observer = presence.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => observer.observe(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence observer lagged behind the event hub");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app_state = AppState {
        living_map: living_map.clone(),
        presence: presence.clone(),
        hub,
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 5. HTTP API until the server fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // -----------------------------------------------------------------------
    // 6. Shutdown
    // -----------------------------------------------------------------------
    presence.stop_presence_tracking().await;

    let unpreserved = living_map.shutdown();
    for connection in &unpreserved {
        warn!(
            connection = %connection.id,
            prayer = %connection.prayer_id,
            "Memorial line not yet durable at shutdown"
        );
    }
    info!(unpreserved = unpreserved.len(), "Shutdown complete");

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}

//! Presence and heartbeat tracking.
//!
//! The tracker keeps the current user's status fresh with a periodic
//! heartbeat and mirrors other users' presence into a local cache. The
//! heartbeat slows to twice its base interval while the app is in the
//! background or the battery is low, and every platform signal triggers an
//! immediate re-assertion.
//!
//! Presence is best effort: failed writes are logged and forgotten, the
//! next heartbeat corrects them. There is deliberately no retry queue here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use prayermap_shared::{
    DeviceId, OnlineStats, PrayerId, PresenceRecord, PresenceStatus, RealtimeEvent, UserId,
};

use crate::channel::MessagingChannel;
use crate::config::RealtimeConfig;
use crate::environment::{EnvironmentSignal, EnvironmentSnapshot, EnvironmentSource};
use crate::error::Result;
use crate::lock;
use crate::store::DurableStore;

struct TrackerState {
    current_user: Option<UserId>,
    cache: HashMap<UserId, PresenceRecord>,
    env: EnvironmentSnapshot,
    heartbeat_interval: Duration,
    heartbeat: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn DurableStore>,
    channel: Arc<dyn MessagingChannel>,
    environment: Arc<dyn EnvironmentSource>,
    device_id: DeviceId,
    base_interval: Duration,
    low_battery_threshold: f32,
    state: Mutex<TrackerState>,
}

/// Tracks the current user's presence and caches everyone else's.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn DurableStore>,
        channel: Arc<dyn MessagingChannel>,
        environment: Arc<dyn EnvironmentSource>,
        device_id: DeviceId,
        config: &RealtimeConfig,
    ) -> Self {
        let env = environment.snapshot();
        Self {
            inner: Arc::new(Inner {
                store,
                channel,
                environment,
                device_id,
                base_interval: config.heartbeat_base,
                low_battery_threshold: config.low_battery_threshold,
                state: Mutex::new(TrackerState {
                    current_user: None,
                    cache: HashMap::new(),
                    env,
                    heartbeat_interval: config.heartbeat_base,
                    heartbeat: None,
                    watcher: None,
                }),
            }),
        }
    }

    /// Begin tracking `user_id`: write the initial status, subscribe to
    /// platform signals and start the heartbeat.
    ///
    /// Calling this again replaces the running heartbeat instead of adding
    /// a second one.
    pub async fn start_presence_tracking(
        &self,
        user_id: UserId,
        initial_status: PresenceStatus,
        custom_status: Option<String>,
    ) {
        let signals = self.inner.environment.subscribe();
        {
            let mut state = lock(&self.inner.state);
            state.current_user = Some(user_id.clone());
            state.env = self.inner.environment.snapshot();
        }

        info!(user = %user_id, status = %initial_status, "Starting presence tracking");
        self.update_presence(&user_id, initial_status, custom_status, Vec::new())
            .await;

        self.spawn_watcher(signals);
        let interval = self.desired_interval();
        self.restart_heartbeat(interval);
    }

    /// Write a presence record through to the store and the local cache.
    ///
    /// A delta is broadcast only when the status differs from the cached
    /// one. Store failures are logged and swallowed.
    pub async fn update_presence(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
        custom_status: Option<String>,
        active_task_ids: Vec<PrayerId>,
    ) {
        let record = PresenceRecord {
            user_id: user_id.clone(),
            status,
            last_seen: Utc::now(),
            custom_status,
            active_task_ids,
            device_id: self.inner.device_id.clone(),
            connection_count: if status == PresenceStatus::Offline { 0 } else { 1 },
        };

        if let Err(e) = self.inner.store.upsert_presence(&record).await {
            warn!(user = %user_id, status = %status, error = %e, "Presence update failed");
            return;
        }

        let previous = {
            let mut state = lock(&self.inner.state);
            state
                .cache
                .insert(user_id.clone(), record.clone())
                .map(|r| r.status)
        };

        if previous == Some(status) {
            debug!(user = %user_id, status = %status, "Presence re-asserted");
            return;
        }

        let event = RealtimeEvent::presence_delta(record);
        debug!(
            user = %user_id,
            from = ?previous,
            to = %status,
            event = event.event_name(),
            "Broadcasting presence delta"
        );
        if let Err(e) = self.inner.channel.send(event).await {
            warn!(user = %user_id, error = %e, "Presence broadcast failed");
        }
    }

    /// `ActiveTask` when `task_ids` is non-empty, otherwise `Online`.
    pub async fn set_active_task_status(
        &self,
        user_id: &UserId,
        task_ids: Vec<PrayerId>,
        custom_status: Option<String>,
    ) {
        let status = if task_ids.is_empty() {
            PresenceStatus::Online
        } else {
            PresenceStatus::ActiveTask
        };
        self.update_presence(user_id, status, custom_status, task_ids)
            .await;
    }

    /// Mark the user offline and stop the heartbeat and signal watcher.
    pub async fn stop_presence_tracking(&self) {
        let user = {
            let mut state = lock(&self.inner.state);
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.abort();
            }
            if let Some(watcher) = state.watcher.take() {
                watcher.abort();
            }
            state.current_user.take()
        };

        if let Some(user) = user {
            info!(user = %user, "Stopping presence tracking");
            self.update_presence(&user, PresenceStatus::Offline, None, Vec::new())
                .await;
        }
    }

    pub async fn get_online_stats(&self) -> Result<OnlineStats> {
        self.inner.store.online_stats().await.map_err(|e| {
            warn!(error = %e, "Online stats query failed");
            e
        })
    }

    /// Query the store for a user's presence and refresh the cache.
    pub async fn fetch_presence(&self, user_id: &UserId) -> Result<Option<PresenceRecord>> {
        let record = self.inner.store.fetch_presence(user_id).await?;
        if let Some(ref record) = record {
            lock(&self.inner.state)
                .cache
                .insert(user_id.clone(), record.clone());
        }
        Ok(record)
    }

    pub fn cached_presence(&self, user_id: &UserId) -> Option<PresenceRecord> {
        lock(&self.inner.state).cache.get(user_id).cloned()
    }

    /// Feed an event received from the shared channel into the cache.
    ///
    /// Echoes of this device's own writes are ignored.
    pub fn observe(&self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::PresenceChanged(record) | RealtimeEvent::ActiveTaskStarted(record) => {
                if record.device_id == self.inner.device_id {
                    return;
                }
                let mut state = lock(&self.inner.state);
                state.cache.insert(record.user_id.clone(), record.clone());
                debug!(user = %record.user_id, status = %record.status, "Cached remote presence");
            }
            RealtimeEvent::MapUpdate(_)
            | RealtimeEvent::MemorialLineCreated(_)
            | RealtimeEvent::ChatMessage(_) => {}
        }
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock(&self.inner.state).current_user.clone()
    }

    pub fn current_status(&self) -> Option<PresenceStatus> {
        let state = lock(&self.inner.state);
        let user = state.current_user.as_ref()?;
        state.cache.get(user).map(|r| r.status)
    }

    /// Number of users in the local presence cache.
    pub fn tracked_count(&self) -> usize {
        lock(&self.inner.state).cache.len()
    }

    /// Interval of the running heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        lock(&self.inner.state).heartbeat_interval
    }

    pub fn is_heartbeat_running(&self) -> bool {
        lock(&self.inner.state)
            .heartbeat
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn environment(&self) -> EnvironmentSnapshot {
        lock(&self.inner.state).env
    }

    /// Re-assert the current user's status from the environment.
    ///
    /// Offline connectivity asserts `Offline`, background asserts `Away`.
    /// In the foreground an active-task status keeps its tasks; anything
    /// else becomes `Online`.
    async fn assert_current_status(&self) {
        let next = {
            let state = lock(&self.inner.state);
            let Some(user) = state.current_user.clone() else {
                return;
            };
            let cached = state.cache.get(&user);
            let custom = cached.and_then(|r| r.custom_status.clone());

            if !state.env.online {
                (user, PresenceStatus::Offline, custom, Vec::new())
            } else if state.env.is_background() {
                (user, PresenceStatus::Away, custom, Vec::new())
            } else {
                match cached {
                    Some(r) if r.status == PresenceStatus::ActiveTask => {
                        let tasks = r.active_task_ids.clone();
                        (user, PresenceStatus::ActiveTask, custom, tasks)
                    }
                    _ => (user, PresenceStatus::Online, custom, Vec::new()),
                }
            }
        };

        let (user, status, custom, tasks) = next;
        self.update_presence(&user, status, custom, tasks).await;
    }

    fn desired_interval(&self) -> Duration {
        let state = lock(&self.inner.state);
        if state.env.is_background() || state.env.is_low_battery(self.inner.low_battery_threshold) {
            self.inner.base_interval * 2
        } else {
            self.inner.base_interval
        }
    }

    /// Restart the heartbeat if the desired cadence changed.
    fn evaluate_cadence(&self) {
        let desired = self.desired_interval();
        let (current, running) = {
            let state = lock(&self.inner.state);
            (state.heartbeat_interval, state.heartbeat.is_some())
        };
        if running && desired != current {
            info!(
                from_secs = current.as_secs(),
                to_secs = desired.as_secs(),
                "Adjusting heartbeat cadence"
            );
            self.restart_heartbeat(desired);
        }
    }

    fn restart_heartbeat(&self, interval: Duration) {
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Presence heartbeat");
                tracker.assert_current_status().await;
            }
        });

        let mut state = lock(&self.inner.state);
        state.heartbeat_interval = interval;
        if let Some(previous) = state.heartbeat.replace(handle) {
            previous.abort();
        }
    }

    fn spawn_watcher(&self, mut signals: Receiver<EnvironmentSignal>) {
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(EnvironmentSignal::Terminating) => {
                        tracker.on_terminating();
                        break;
                    }
                    Ok(signal) => {
                        lock(&tracker.inner.state).env.apply(signal);
                        debug!(?signal, "Environment changed");
                        tracker.assert_current_status().await;
                        tracker.evaluate_cadence();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed environment signals, resyncing");
                        lock(&tracker.inner.state).env = tracker.inner.environment.snapshot();
                        tracker.assert_current_status().await;
                        tracker.evaluate_cadence();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut state = lock(&self.inner.state);
        if let Some(previous) = state.watcher.replace(handle) {
            previous.abort();
        }
    }

    /// Teardown path: fire the offline beacon without waiting on it.
    fn on_terminating(&self) {
        let mut state = lock(&self.inner.state);
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.abort();
        }
        let Some(user) = state.current_user.clone() else {
            return;
        };

        info!(user = %user, "Terminating, sending offline beacon");
        self.inner.store.send_offline_beacon(&user, &self.inner.device_id);
        if let Some(record) = state.cache.get_mut(&user) {
            record.status = PresenceStatus::Offline;
            record.connection_count = 0;
            record.active_task_ids.clear();
        }
    }
}

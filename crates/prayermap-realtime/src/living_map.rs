//! Living-map priority arbitration.
//!
//! [`LivingMap`] is the single entry point for the three traffic classes
//! that share the realtime channel:
//!
//! - **Map updates** are preemptive. They grab the whole allocation, must
//!   finish within the configured budget (2 s by default) and propagate
//!   failures to the caller. A slow map update triggers degraded mode.
//! - **Memorial lines** go through the [`MemorialProtector`] and are retried
//!   until they stick.
//! - **Chat messages** are deferred whenever map updates are running,
//!   throttling is active, bandwidth is exhausted or utilization is high.
//!   Deferred messages wait in a bounded FIFO queue that sheds its oldest
//!   half on overflow.
//!
//! Two monitors keep the metrics fresh: utilization every second and a full
//! snapshot with a compliance check every five seconds.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use prayermap_shared::constants::{MESSAGING_DEFER_UTILIZATION_PCT, UTILIZATION_WARNING_PCT};
use prayermap_shared::{ChatMessage, MapUpdate, PrayerConnection, PriorityClass, RealtimeEvent};

use crate::allocator::ResourceAllocator;
use crate::bandwidth::{BandwidthMonitor, BandwidthStatus};
use crate::channel::MessagingChannel;
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::lock;
use crate::memorial::{MemorialProtector, MemorialStatus};
use crate::presence::PresenceTracker;
use crate::store::DurableStore;

// Utilization weights. Without a map update in flight the total stays
// below the messaging deferral threshold, so a backlog can always drain.
const MAP_IN_PROGRESS_LOAD: f64 = 50.0;
const QUEUE_LOAD_PER_MESSAGE: f64 = 0.5;
const QUEUE_LOAD_CAP: f64 = 30.0;
const BANDWIDTH_LOAD_WEIGHT: f64 = 30.0;

/// Latest measurements, refreshed by the monitors and by each handler.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PerformanceMetrics {
    pub map_update_latency_ms: u64,
    pub message_latency_ms: u64,
    pub memorial_line_latency_ms: u64,
    pub total_bandwidth_bytes: u64,
    pub resource_utilization_pct: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What happened to a chat message handed to the arbiter.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    /// Queued for a later flush.
    Deferred,
    /// The transport rejected the send; the message is not re-queued.
    Failed,
}

/// Read-only snapshot for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct LivingMapStatus {
    pub metrics: PerformanceMetrics,
    pub throttling_active: bool,
    pub map_update_in_progress: bool,
    pub queue_depth: usize,
    pub dropped_messages: u64,
    pub living_map_compliant: bool,
    pub bandwidth: BandwidthStatus,
    pub allocations: HashMap<PriorityClass, u8>,
    pub memorial: MemorialStatus,
    pub tracked_presences: usize,
}

struct QueuedMessage {
    message: ChatMessage,
    enqueued_at: Instant,
}

#[derive(Default)]
struct ArbiterState {
    map_updates_in_flight: usize,
    throttling: bool,
    throttle_timer: Option<JoinHandle<()>>,
    queue: VecDeque<QueuedMessage>,
    dropped_messages: u64,
    flushing: bool,
    metrics: PerformanceMetrics,
    monitors: Vec<JoinHandle<()>>,
}

struct Inner {
    config: RealtimeConfig,
    channel: Arc<dyn MessagingChannel>,
    memorials: MemorialProtector,
    presence: Option<PresenceTracker>,
    bandwidth: Mutex<BandwidthMonitor>,
    allocator: Mutex<ResourceAllocator>,
    state: Mutex<ArbiterState>,
}

/// Top-level coordinator of the realtime channel.
#[derive(Clone)]
pub struct LivingMap {
    inner: Arc<Inner>,
}

/// Marks a map update as in flight until dropped, even if the handler
/// future is cancelled.
struct MapUpdateGuard {
    map: LivingMap,
}

impl Drop for MapUpdateGuard {
    fn drop(&mut self) {
        self.map.finish_map_update();
    }
}

/// Clears the flushing flag when a flush ends or is cancelled.
struct FlushGuard<'a> {
    state: &'a Mutex<ArbiterState>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).flushing = false;
    }
}

impl LivingMap {
    pub fn new(
        config: RealtimeConfig,
        store: Arc<dyn DurableStore>,
        channel: Arc<dyn MessagingChannel>,
        presence: Option<PresenceTracker>,
    ) -> Self {
        let memorials = MemorialProtector::new(
            store,
            config.memorial_retry_initial,
            config.memorial_retry_steady,
        );
        let bandwidth = BandwidthMonitor::new(config.bandwidth_limit_bytes);

        Self {
            inner: Arc::new(Inner {
                config,
                channel,
                memorials,
                presence,
                bandwidth: Mutex::new(bandwidth),
                allocator: Mutex::new(ResourceAllocator::new()),
                state: Mutex::new(ArbiterState::default()),
            }),
        }
    }

    /// Spawn the utilization and metrics monitors, the memorial integrity
    /// monitor and the memorial broadcast relay. Calling it twice replaces
    /// the running monitors.
    pub fn start(&self) {
        let config = &self.inner.config;

        let map = self.clone();
        let period = config.utilization_interval;
        let utilization = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                map.update_resource_utilization();
                // Nothing else releases a backlog held for bandwidth or utilization.
                if map.queue_depth() > 0 && !map.should_defer_messaging() {
                    map.schedule_flush(None);
                }
            }
        });

        let map = self.clone();
        let period = config.metrics_interval;
        let metrics = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                map.refresh_metrics();
            }
        });

        let map = self.clone();
        let mut preserved = self.inner.memorials.subscribe_preserved();
        let relay = tokio::spawn(async move {
            loop {
                match preserved.recv().await {
                    Ok(connection) => map.publish_memorial(connection).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memorial broadcast relay lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.inner
            .memorials
            .spawn_integrity_monitor(config.integrity_check_interval);

        let mut state = lock(&self.inner.state);
        for monitor in state.monitors.drain(..) {
            monitor.abort();
        }
        state.monitors = vec![utilization, metrics, relay];
        info!(
            budget_ms = config.map_update_budget.as_millis() as u64,
            bandwidth_limit = config.bandwidth_limit_bytes,
            "Living map monitoring started"
        );
    }

    /// Stop every timer owned by the arbiter and its memorial protector.
    ///
    /// Returns memorial lines that were still waiting for a successful write.
    pub fn shutdown(&self) -> Vec<PrayerConnection> {
        {
            let mut state = lock(&self.inner.state);
            for monitor in state.monitors.drain(..) {
                monitor.abort();
            }
            if let Some(timer) = state.throttle_timer.take() {
                timer.abort();
            }
            info!(queued = state.queue.len(), "Living map shutting down");
        }
        lock(&self.inner.allocator).clear();
        self.inner.memorials.shutdown()
    }

    // -----------------------------------------------------------------------
    // Map updates
    // -----------------------------------------------------------------------

    /// Apply a map update with top priority.
    ///
    /// Errors are returned to the caller after the in-progress flag has been
    /// cleared. Exceeding the latency budget is not an error; it triggers
    /// degraded mode instead.
    pub async fn handle_map_update(&self, update: &MapUpdate) -> Result<()> {
        let started = Instant::now();

        lock(&self.inner.allocator).allocate_for_priority_class(PriorityClass::MapUpdate);

        if self.inner.config.throttling_enabled && self.should_throttle_messaging() {
            self.activate_throttling();
        }

        let _guard = self.begin_map_update();

        self.inner.memorials.ensure_memorial_preservation(update);

        let event = RealtimeEvent::MapUpdate(update.clone());
        let bytes = event
            .to_bytes()
            .map(|b| b.len() as u64)
            .map_err(|e| RealtimeError::Serialization(e.to_string()))?;
        let result = self.inner.channel.send(event).await;
        if result.is_ok() {
            lock(&self.inner.bandwidth).record_transfer(bytes);
        }

        let elapsed = started.elapsed();
        lock(&self.inner.state).metrics.map_update_latency_ms = elapsed.as_millis() as u64;

        if elapsed > self.inner.config.map_update_budget {
            error!(
                prayer = %update.prayer_id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.inner.config.map_update_budget.as_millis() as u64,
                "Map update exceeded living map budget"
            );
            self.optimize_for_compliance();
        } else {
            debug!(
                prayer = %update.prayer_id,
                kind = ?update.kind,
                elapsed_ms = elapsed.as_millis() as u64,
                "Map update applied"
            );
        }

        result.map_err(|e| {
            error!(prayer = %update.prayer_id, error = %e, "Map update failed");
            RealtimeError::MapUpdate(e.to_string())
        })
    }

    pub fn is_map_update_in_progress(&self) -> bool {
        lock(&self.inner.state).map_updates_in_flight > 0
    }

    fn begin_map_update(&self) -> MapUpdateGuard {
        lock(&self.inner.state).map_updates_in_flight += 1;
        MapUpdateGuard { map: self.clone() }
    }

    /// Called from the guard. When the last map update finishes, release the
    /// allocation and let the message backlog drain.
    fn finish_map_update(&self) {
        let drain = {
            let mut state = lock(&self.inner.state);
            state.map_updates_in_flight = state.map_updates_in_flight.saturating_sub(1);
            if state.map_updates_in_flight > 0 {
                return;
            }
            !state.queue.is_empty()
        };

        lock(&self.inner.allocator).release(PriorityClass::MapUpdate);

        if drain {
            self.schedule_flush(None);
        }
    }

    // -----------------------------------------------------------------------
    // Memorial lines
    // -----------------------------------------------------------------------

    /// Create a memorial line. On failure a retry is guaranteed and the error
    /// is still returned so the caller can react.
    pub async fn handle_memorial_line_creation(&self, connection: &PrayerConnection) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.memorials.create_eternal_memorial(connection).await;
        lock(&self.inner.state).metrics.memorial_line_latency_ms =
            started.elapsed().as_millis() as u64;

        if let Err(e) = result {
            error!(connection = %connection.id, error = %e, "Memorial line creation failed");
            self.inner
                .memorials
                .retry_memorial_creation(connection.clone());
            return Err(e);
        }
        Ok(())
    }

    pub fn memorials(&self) -> &MemorialProtector {
        &self.inner.memorials
    }

    async fn publish_memorial(&self, connection: PrayerConnection) {
        let id = connection.id;
        let event = RealtimeEvent::MemorialLineCreated(connection);
        let bytes = match event.to_bytes() {
            Ok(bytes) => bytes.len() as u64,
            Err(e) => {
                warn!(connection = %id, error = %e, "Memorial event serialization failed");
                0
            }
        };
        match self.inner.channel.send(event).await {
            Ok(()) => lock(&self.inner.bandwidth).record_transfer(bytes),
            Err(e) => warn!(connection = %id, error = %e, "Memorial broadcast failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Deliver a chat message now, or queue it when higher-priority traffic
    /// needs the channel. Never fails; transport errors are logged.
    pub async fn handle_message_delivery(&self, message: ChatMessage) -> DeliveryOutcome {
        if self.should_defer_messaging() {
            self.enqueue(message);
            return DeliveryOutcome::Deferred;
        }

        // Keep FIFO order behind an existing backlog.
        if self.queue_depth() > 0 {
            self.enqueue(message);
            self.schedule_flush(None);
            return DeliveryOutcome::Deferred;
        }

        if !lock(&self.inner.allocator).allocate_for_messaging() {
            self.enqueue(message);
            return DeliveryOutcome::Deferred;
        }

        let outcome = self.deliver(message).await;
        lock(&self.inner.allocator).release(PriorityClass::Messaging);
        outcome
    }

    /// True while map updates run, throttling is active, bandwidth is over
    /// budget or utilization is above the deferral threshold.
    pub fn should_defer_messaging(&self) -> bool {
        let (in_flight, throttling, utilization) = {
            let state = lock(&self.inner.state);
            (
                state.map_updates_in_flight > 0,
                state.throttling,
                state.metrics.resource_utilization_pct,
            )
        };
        if in_flight || throttling || utilization > MESSAGING_DEFER_UTILIZATION_PCT {
            return true;
        }
        lock(&self.inner.bandwidth).is_over_limit()
    }

    pub fn queue_depth(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Snapshot of the deferred queue, oldest first.
    pub fn queued_messages(&self) -> Vec<ChatMessage> {
        lock(&self.inner.state)
            .queue
            .iter()
            .map(|q| q.message.clone())
            .collect()
    }

    /// Deliver queued messages in order until deferral kicks in again or the
    /// queue is empty. Only one flush runs at a time. Returns the number of
    /// messages sent.
    pub async fn flush_queue(&self) -> usize {
        {
            let mut state = lock(&self.inner.state);
            if state.flushing || state.queue.is_empty() {
                return 0;
            }
            state.flushing = true;
        }
        let _guard = FlushGuard {
            state: &self.inner.state,
        };

        let mut sent = 0;
        loop {
            if self.should_defer_messaging() {
                break;
            }
            let Some(queued) = lock(&self.inner.state).queue.pop_front() else {
                break;
            };
            if !lock(&self.inner.allocator).allocate_for_messaging() {
                lock(&self.inner.state).queue.push_front(queued);
                break;
            }

            debug!(
                message = %queued.message.id,
                waited_ms = queued.enqueued_at.elapsed().as_millis() as u64,
                "Flushing deferred message"
            );
            let outcome = self.deliver(queued.message).await;
            lock(&self.inner.allocator).release(PriorityClass::Messaging);
            if outcome == DeliveryOutcome::Sent {
                sent += 1;
            }
        }

        let remaining = self.queue_depth();
        if sent > 0 || remaining > 0 {
            info!(sent, remaining, "Message queue flushed");
        }
        sent
    }

    fn enqueue(&self, message: ChatMessage) {
        let cap = self.inner.config.message_queue_cap;
        let mut state = lock(&self.inner.state);
        debug!(message = %message.id, depth = state.queue.len() + 1, "Deferring message");
        state.queue.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
        });

        if state.queue.len() > cap {
            let dropped = state.queue.len() / 2;
            state.queue.drain(..dropped);
            state.dropped_messages += dropped as u64;
            warn!(
                dropped,
                remaining = state.queue.len(),
                "Message queue overflow, dropped oldest half"
            );
        }
    }

    async fn deliver(&self, message: ChatMessage) -> DeliveryOutcome {
        let id = message.id;
        let started = Instant::now();
        let result = self.inner.channel.send(RealtimeEvent::ChatMessage(message)).await;
        let elapsed = started.elapsed();

        lock(&self.inner.state).metrics.message_latency_ms = elapsed.as_millis() as u64;

        match result {
            Ok(()) => {
                lock(&self.inner.bandwidth).record_transfer(self.inner.config.message_size_estimate);
                if elapsed > self.inner.config.message_latency_ceiling {
                    warn!(
                        message = %id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Message latency above ceiling, throttling"
                    );
                    self.activate_throttling();
                }
                DeliveryOutcome::Sent
            }
            Err(e) => {
                warn!(message = %id, error = %e, "Message delivery failed");
                DeliveryOutcome::Failed
            }
        }
    }

    /// Spawn a flush, optionally after a delay. No-op outside a runtime.
    fn schedule_flush(&self, delay: Option<std::time::Duration>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let map = self.clone();
        runtime.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            map.flush_queue().await;
        });
    }

    // -----------------------------------------------------------------------
    // Throttling and degraded mode
    // -----------------------------------------------------------------------

    fn should_throttle_messaging(&self) -> bool {
        let utilization = lock(&self.inner.state).metrics.resource_utilization_pct;
        utilization > MESSAGING_DEFER_UTILIZATION_PCT
            || lock(&self.inner.bandwidth).is_approaching_limit()
    }

    /// Enter throttled mode for one window. While a window is already open
    /// this does nothing. Outside a tokio runtime no window can be timed, so
    /// the call is ignored.
    pub fn activate_throttling(&self) {
        self.open_throttle_window(false);
    }

    /// Leave throttled mode early and flush the backlog.
    pub async fn deactivate_throttling(&self) {
        if let Some(timer) = lock(&self.inner.state).throttle_timer.take() {
            timer.abort();
        }
        self.close_throttle_window().await;
    }

    pub fn is_throttling(&self) -> bool {
        lock(&self.inner.state).throttling
    }

    /// `force` restarts the window even if one is already open.
    fn open_throttle_window(&self, force: bool) {
        let window = self.inner.config.throttle_window;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, throttling window not opened");
            return;
        };
        {
            let mut state = lock(&self.inner.state);
            if state.throttling && !force {
                return;
            }
            state.throttling = true;

            let map = self.clone();
            let timer = runtime.spawn(async move {
                tokio::time::sleep(window).await;
                map.close_throttle_window().await;
            });
            if let Some(previous) = state.throttle_timer.replace(timer) {
                previous.abort();
            }
        }

        self.inner.channel.enable_efficient_mode();
        info!(window_secs = window.as_secs(), force, "Messaging throttled");
    }

    async fn close_throttle_window(&self) {
        {
            let mut state = lock(&self.inner.state);
            if !state.throttling {
                return;
            }
            state.throttling = false;
            state.throttle_timer = None;
        }

        self.inner.channel.disable_efficient_mode();
        if self.is_compliant() {
            lock(&self.inner.bandwidth).restore_limit();
        }
        info!(queued = self.queue_depth(), "Throttling window closed");

        self.flush_queue().await;
    }

    /// One-shot remediation after a compliance violation.
    fn optimize_for_compliance(&self) {
        warn!("Entering degraded mode to protect map updates");
        self.inner.channel.enable_efficient_mode();
        self.open_throttle_window(true);
        self.schedule_flush(Some(self.inner.config.idle_flush_delay));
        lock(&self.inner.allocator).free_non_critical_resources();
        lock(&self.inner.bandwidth).enable_aggressive_monitoring();
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    fn update_resource_utilization(&self) -> f64 {
        let ratio = lock(&self.inner.bandwidth).utilization_ratio().min(1.0);
        let mut state = lock(&self.inner.state);

        let map_load = if state.map_updates_in_flight > 0 {
            MAP_IN_PROGRESS_LOAD
        } else {
            0.0
        };
        let queue_load = (state.queue.len() as f64 * QUEUE_LOAD_PER_MESSAGE).min(QUEUE_LOAD_CAP);
        let utilization = (map_load + queue_load + ratio * BANDWIDTH_LOAD_WEIGHT).min(100.0);

        state.metrics.resource_utilization_pct = utilization;
        utilization
    }

    /// Full snapshot plus compliance check.
    fn refresh_metrics(&self) {
        let utilization = self.update_resource_utilization();
        let usage = lock(&self.inner.bandwidth).current_usage();

        let (map_latency, throttling) = {
            let mut state = lock(&self.inner.state);
            state.metrics.total_bandwidth_bytes = usage;
            state.metrics.updated_at = Some(Utc::now());
            (state.metrics.map_update_latency_ms, state.throttling)
        };

        let budget_ms = self.inner.config.map_update_budget.as_millis() as u64;
        if map_latency > budget_ms {
            warn!(
                map_update_latency_ms = map_latency,
                budget_ms,
                "Living map out of compliance"
            );
            if !throttling {
                self.optimize_for_compliance();
            }
        }
        if utilization > UTILIZATION_WARNING_PCT {
            warn!(utilization, "Resource utilization high");
        }
    }

    pub fn is_compliant(&self) -> bool {
        let budget_ms = self.inner.config.map_update_budget.as_millis() as u64;
        lock(&self.inner.state).metrics.map_update_latency_ms <= budget_ms
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        lock(&self.inner.state).metrics.clone()
    }

    pub fn status(&self) -> LivingMapStatus {
        let bandwidth = lock(&self.inner.bandwidth).status();
        let allocations = lock(&self.inner.allocator).snapshot();
        let memorial = self.inner.memorials.status();
        let tracked_presences = self
            .inner
            .presence
            .as_ref()
            .map(|p| p.tracked_count())
            .unwrap_or(0);
        let living_map_compliant = self.is_compliant();

        let state = lock(&self.inner.state);
        LivingMapStatus {
            metrics: state.metrics.clone(),
            throttling_active: state.throttling,
            map_update_in_progress: state.map_updates_in_flight > 0,
            queue_depth: state.queue.len(),
            dropped_messages: state.dropped_messages,
            living_map_compliant,
            bandwidth,
            allocations,
            memorial,
            tracked_presences,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use prayermap_shared::{
        ConnectionId, ConversationId, DeviceId, GeoPoint, MapUpdateKind, MessageId, OnlineStats,
        PrayerId, PresenceRecord, UserId,
    };

    #[derive(Default)]
    struct TestStore {
        failures: AtomicU32,
    }

    #[async_trait]
    impl DurableStore for TestStore {
        async fn create_connection(&self, _connection: &PrayerConnection) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RealtimeError::Store("timeout".into()));
            }
            Ok(())
        }

        async fn upsert_presence(&self, _record: &PresenceRecord) -> Result<()> {
            Ok(())
        }

        async fn fetch_presence(&self, _user_id: &UserId) -> Result<Option<PresenceRecord>> {
            Ok(None)
        }

        async fn online_stats(&self) -> Result<OnlineStats> {
            Ok(OnlineStats::default())
        }

        fn send_offline_beacon(&self, _user_id: &UserId, _device_id: &DeviceId) {}
    }

    #[derive(Default)]
    struct TestChannel {
        map_delay: Mutex<Duration>,
        chat_delay: Mutex<Duration>,
        fail_map: AtomicBool,
        fail_chat: AtomicBool,
        efficient: AtomicBool,
        events: Mutex<Vec<RealtimeEvent>>,
    }

    #[async_trait]
    impl MessagingChannel for TestChannel {
        fn enable_efficient_mode(&self) {
            self.efficient.store(true, Ordering::SeqCst);
        }

        fn disable_efficient_mode(&self) {
            self.efficient.store(false, Ordering::SeqCst);
        }

        async fn send(&self, event: RealtimeEvent) -> Result<()> {
            let (delay, fail) = match &event {
                RealtimeEvent::MapUpdate(_) => (*lock(&self.map_delay), self.fail_map.load(Ordering::SeqCst)),
                RealtimeEvent::ChatMessage(_) => (*lock(&self.chat_delay), self.fail_chat.load(Ordering::SeqCst)),
                _ => (Duration::ZERO, false),
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(RealtimeError::Transport("channel closed".into()));
            }
            lock(&self.events).push(event);
            Ok(())
        }
    }

    fn living_map(channel: Arc<TestChannel>) -> LivingMap {
        LivingMap::new(
            RealtimeConfig::default(),
            Arc::new(TestStore::default()),
            channel,
            None,
        )
    }

    fn map_update() -> MapUpdate {
        MapUpdate {
            prayer_id: PrayerId::new(),
            kind: MapUpdateKind::PrayerPosted,
            location: GeoPoint::new(34.05, -118.24).unwrap(),
            actor_id: UserId::new("poster").unwrap(),
            connection_id: None,
            occurred_at: Utc::now(),
        }
    }

    fn message(body: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender_id: UserId::new("sender").unwrap(),
            body: body.to_string(),
            sent_at: Utc::now(),
        }
    }

    fn connection() -> PrayerConnection {
        PrayerConnection {
            id: ConnectionId::new(),
            prayer_id: PrayerId::new(),
            requester_id: UserId::new("requester").unwrap(),
            responder_id: UserId::new("responder").unwrap(),
            requester_location: GeoPoint::new(1.0, 1.0).unwrap(),
            responder_location: GeoPoint::new(2.0, 2.0).unwrap(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_sent_when_idle() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel.clone());

        assert_eq!(map.handle_message_delivery(message("hi")).await, DeliveryOutcome::Sent);
        assert_eq!(lock(&channel.events).len(), 1);
        assert_eq!(map.status().bandwidth.current_usage, 1_024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_update_publishes_and_clears_flag() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel.clone());

        map.handle_map_update(&map_update()).await.unwrap();

        assert!(!map.is_map_update_in_progress());
        assert_eq!(map.status().allocations.get(&PriorityClass::MapUpdate), None);
        assert!(matches!(lock(&channel.events)[0], RealtimeEvent::MapUpdate(_)));
        assert!(map.is_compliant());
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_update_error_propagates_after_cleanup() {
        let channel = Arc::new(TestChannel::default());
        channel.fail_map.store(true, Ordering::SeqCst);
        let map = living_map(channel);

        let err = map.handle_map_update(&map_update()).await.unwrap_err();
        assert!(matches!(err, RealtimeError::MapUpdate(_)));
        assert!(!map.is_map_update_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_map_update_clears_flag() {
        let channel = Arc::new(TestChannel::default());
        *lock(&channel.map_delay) = Duration::from_secs(10);
        let map = living_map(channel);

        let update = map_update();
        let result =
            tokio::time::timeout(Duration::from_secs(1), map.handle_map_update(&update)).await;
        assert!(result.is_err());
        assert!(!map.is_map_update_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_deferred_during_map_update() {
        let channel = Arc::new(TestChannel::default());
        *lock(&channel.map_delay) = Duration::from_millis(500);
        let map = living_map(channel.clone());

        let updater = map.clone();
        let update = tokio::spawn(async move { updater.handle_map_update(&map_update()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(map.should_defer_messaging());
        assert_eq!(map.handle_message_delivery(message("wait")).await, DeliveryOutcome::Deferred);
        assert_eq!(map.queue_depth(), 1);

        update.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(map.queue_depth(), 0);
        let events = lock(&channel.events);
        assert!(matches!(events[0], RealtimeEvent::MapUpdate(_)));
        assert!(matches!(events[1], RealtimeEvent::ChatMessage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_sheds_oldest_half_on_overflow() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel);
        map.activate_throttling();

        let messages: Vec<ChatMessage> = (0..150).map(|i| message(&format!("m{i}"))).collect();
        for m in &messages {
            assert_eq!(map.handle_message_delivery(m.clone()).await, DeliveryOutcome::Deferred);
        }

        let queued = map.queued_messages();
        assert!(queued.len() <= 100);
        assert!(queued.len() >= 50);
        assert_eq!(queued.last().unwrap().id, messages[149].id);
        let first = messages.iter().position(|m| m.id == queued[0].id).unwrap();
        assert_eq!(&messages[first..], &queued[..]);
        assert_eq!(map.status().dropped_messages as usize, 150 - queued.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window_expires_and_flushes() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel.clone());

        map.activate_throttling();
        assert!(channel.efficient.load(Ordering::SeqCst));
        map.handle_message_delivery(message("later")).await;
        assert_eq!(map.queue_depth(), 1);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(map.is_throttling());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!map.is_throttling());
        assert!(!channel.efficient.load(Ordering::SeqCst));
        assert_eq!(map.queue_depth(), 0);
        assert_eq!(lock(&channel.events).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_does_not_extend_window() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel);

        map.activate_throttling();
        tokio::time::sleep(Duration::from_secs(20)).await;
        map.activate_throttling();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!map.is_throttling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_map_update_triggers_degraded_mode() {
        let channel = Arc::new(TestChannel::default());
        *lock(&channel.map_delay) = Duration::from_millis(2_500);
        let map = living_map(channel.clone());
        let base_limit = map.status().bandwidth.limit;

        map.handle_map_update(&map_update()).await.unwrap();

        let status = map.status();
        assert!(!status.living_map_compliant);
        assert!(status.throttling_active);
        assert!(channel.efficient.load(Ordering::SeqCst));
        assert_eq!(status.bandwidth.limit, base_limit / 2);
        assert!(status.metrics.map_update_latency_ms >= 2_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_message_activates_throttling() {
        let channel = Arc::new(TestChannel::default());
        *lock(&channel.chat_delay) = Duration::from_secs(6);
        let map = living_map(channel);

        assert_eq!(map.handle_message_delivery(message("slow")).await, DeliveryOutcome::Sent);
        assert!(map.is_throttling());
        assert!(map.metrics().message_latency_ms >= 6_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_message_not_requeued() {
        let channel = Arc::new(TestChannel::default());
        channel.fail_chat.store(true, Ordering::SeqCst);
        let map = living_map(channel);

        assert_eq!(map.handle_message_delivery(message("lost")).await, DeliveryOutcome::Failed);
        assert_eq!(map.queue_depth(), 0);
    }

    fn chat_ids(channel: &TestChannel) -> Vec<MessageId> {
        lock(&channel.events)
            .iter()
            .filter_map(|e| match e {
                RealtimeEvent::ChatMessage(m) => Some(m.id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_deferred_message_flushed_by_monitor() {
        let channel = Arc::new(TestChannel::default());
        let config = RealtimeConfig {
            bandwidth_limit_bytes: 2_000,
            ..RealtimeConfig::default()
        };
        let map = LivingMap::new(config, Arc::new(TestStore::default()), channel.clone(), None);
        map.start();

        assert_eq!(map.handle_message_delivery(message("a")).await, DeliveryOutcome::Sent);
        assert_eq!(map.handle_message_delivery(message("b")).await, DeliveryOutcome::Sent);
        let c = message("c");
        assert_eq!(map.handle_message_delivery(c.clone()).await, DeliveryOutcome::Deferred);

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!map.is_throttling());
        assert_eq!(map.queue_depth(), 0);
        let sent = chat_ids(&channel);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], c.id);
        map.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_utilization_defers_until_it_falls() {
        let channel = Arc::new(TestChannel::default());
        let config = RealtimeConfig {
            bandwidth_limit_bytes: 10_000,
            ..RealtimeConfig::default()
        };
        let map = LivingMap::new(config, Arc::new(TestStore::default()), channel.clone(), None);

        let guard = map.begin_map_update();
        lock(&map.inner.bandwidth).record_transfer(9_500);
        let mut expected = Vec::new();
        for i in 0..20 {
            let m = message(&format!("backlog {i}"));
            expected.push(m.id);
            assert_eq!(map.handle_message_delivery(m).await, DeliveryOutcome::Deferred);
        }
        // 50 in flight, 10 from the queue, 28.5 from bandwidth.
        assert!(map.update_resource_utilization() > 85.0);
        drop(guard);

        assert!(!map.is_map_update_in_progress());
        assert!(!map.is_throttling());
        assert!(!map.status().bandwidth.over_limit);
        assert!(map.should_defer_messaging());
        let late = message("late");
        expected.push(late.id);
        assert_eq!(map.handle_message_delivery(late).await, DeliveryOutcome::Deferred);

        // The flush scheduled by the finished map update still sees the old
        // reading and stops.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(map.queue_depth(), 21);
        assert!(chat_ids(&channel).is_empty());

        map.start();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!map.should_defer_messaging());
        assert_eq!(map.queue_depth(), 0);
        assert_eq!(chat_ids(&channel), expected);
        assert_eq!(map.status().dropped_messages, 0);
        map.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_memorial_broadcast_counts_toward_bandwidth() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel.clone());
        map.start();

        let line = connection();
        map.handle_memorial_line_creation(&line).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let expected = RealtimeEvent::MemorialLineCreated(line).to_bytes().unwrap().len() as u64;
        assert_eq!(map.status().bandwidth.current_usage, expected);
        map.shutdown();
    }

    #[test]
    fn test_throttling_ignored_outside_runtime() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel.clone());

        map.activate_throttling();

        assert!(!map.is_throttling());
        assert!(!channel.efficient.load(Ordering::SeqCst));
        assert!(!map.should_defer_messaging());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memorial_failure_returns_error_and_retries() {
        let channel = Arc::new(TestChannel::default());
        let store = Arc::new(TestStore::default());
        store.failures.store(2, Ordering::SeqCst);
        let map = LivingMap::new(RealtimeConfig::default(), store, channel.clone(), None);
        map.start();

        let line = connection();
        let err = map.handle_memorial_line_creation(&line).await.unwrap_err();
        assert!(matches!(err, RealtimeError::MemorialPending { .. }));
        assert_eq!(map.status().memorial.pending_retries, 1);

        tokio::time::sleep(Duration::from_secs(7)).await;

        let status = map.status();
        assert_eq!(status.memorial.pending_retries, 0);
        assert_eq!(status.memorial.preserved_count, 1);
        assert!(lock(&channel.events)
            .iter()
            .any(|e| matches!(e, RealtimeEvent::MemorialLineCreated(c) if c.id == line.id)));

        map.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_utilization_monitor() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel);
        map.activate_throttling();
        for i in 0..40 {
            map.handle_message_delivery(message(&format!("{i}"))).await;
        }

        assert!((map.update_resource_utilization() - 20.0).abs() < 1e-9);

        let _guard = map.begin_map_update();
        assert!((map.update_resource_utilization() - 70.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_serializes() {
        let channel = Arc::new(TestChannel::default());
        let map = living_map(channel);
        let json = serde_json::to_value(map.status()).unwrap();
        assert_eq!(json["living_map_compliant"], true);
        assert_eq!(json["memorial"]["integrity_status"], "intact");
    }
}

//! Memorial line preservation.
//!
//! A memorial line is a prayer connection drawn between requester and
//! responder. Once generated it must become durable: a failed write is
//! queued and retried by a dedicated worker, first after a short delay and
//! then on a steady cadence, with no attempt limit. Per connection:
//!
//! ```text
//! Pending --ok--> Preserved
//! Pending --err--> Retrying --ok--> Preserved
//!                  Retrying --err--> Retrying
//! ```
//!
//! Nothing here ever deletes a preserved line.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use prayermap_shared::{ConnectionId, MapUpdate, PrayerConnection};

use crate::error::{RealtimeError, Result};
use crate::lock;
use crate::store::DurableStore;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Intact,
    Degraded,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemorialStatus {
    pub preserved_count: usize,
    pub pending_retries: usize,
    pub integrity_status: IntegrityStatus,
    pub last_verified_at: Option<DateTime<Utc>>,
}

struct PendingMemorial {
    connection: PrayerConnection,
    attempts: u32,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ProtectorState {
    preserved: HashSet<ConnectionId>,
    pending: HashMap<ConnectionId, PendingMemorial>,
    last_verified_at: Option<DateTime<Utc>>,
    integrity_monitor: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn DurableStore>,
    retry_initial: Duration,
    retry_steady: Duration,
    preserved_tx: broadcast::Sender<PrayerConnection>,
    state: Mutex<ProtectorState>,
}

/// Guarantees memorial lines are eventually written to the durable store.
#[derive(Clone)]
pub struct MemorialProtector {
    inner: Arc<Inner>,
}

impl MemorialProtector {
    pub fn new(store: Arc<dyn DurableStore>, retry_initial: Duration, retry_steady: Duration) -> Self {
        let (preserved_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                retry_initial,
                retry_steady,
                preserved_tx,
                state: Mutex::new(ProtectorState::default()),
            }),
        }
    }

    /// Hook run alongside every map update, before any connection exists.
    ///
    /// Only records intent. The durability guarantee lives in
    /// [`create_eternal_memorial`](Self::create_eternal_memorial); this is the
    /// place to add pre-validation of the source record.
    pub fn ensure_memorial_preservation(&self, update: &MapUpdate) {
        match update.connection_id {
            Some(id) if self.is_preserved(&id) => {
                debug!(connection = %id, prayer = %update.prayer_id, "Memorial already preserved");
            }
            Some(id) => {
                debug!(connection = %id, prayer = %update.prayer_id, "Memorial preservation intended");
            }
            None => {}
        }
    }

    /// Write a memorial line to the durable store.
    ///
    /// On failure the line is queued and a retry worker is scheduled before
    /// the error is returned, so the retry happens whatever the caller does
    /// with the error. Re-creating an already preserved line is a no-op.
    pub async fn create_eternal_memorial(&self, connection: &PrayerConnection) -> Result<()> {
        if self.is_preserved(&connection.id) {
            debug!(connection = %connection.id, "Memorial already preserved, skipping write");
            return Ok(());
        }

        match self.attempt(connection, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    connection = %connection.id,
                    error = %e,
                    "Memorial write failed, scheduling retry"
                );
                self.retry_memorial_creation(connection.clone());
                Err(RealtimeError::MemorialPending {
                    id: connection.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Make sure a retry worker exists for `connection`.
    ///
    /// The worker waits the initial delay, then keeps retrying on the steady
    /// cadence until the write succeeds or the worker is aborted by
    /// [`shutdown`](Self::shutdown). At most one worker runs per connection.
    pub fn retry_memorial_creation(&self, connection: PrayerConnection) {
        let mut state = lock(&self.inner.state);
        if state.preserved.contains(&connection.id) {
            return;
        }

        let id = connection.id;
        let entry = state.pending.entry(id).or_insert_with(|| PendingMemorial {
            connection: connection.clone(),
            attempts: 0,
            worker: None,
        });

        if entry.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }

        let protector = self.clone();
        let initial = self.inner.retry_initial;
        let steady = self.inner.retry_steady;
        entry.worker = Some(tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::time::sleep(delay).await;
                match protector.attempt(&connection, true).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(connection = %connection.id, error = %e, "Memorial retry failed");
                        delay = steady;
                    }
                }
            }
        }));

        info!(connection = %id, pending = state.pending.len(), "Memorial queued for retry");
    }

    /// Periodic self-check. Degraded while anything is still pending.
    pub fn verify_integrity(&self) -> IntegrityStatus {
        let mut state = lock(&self.inner.state);
        state.last_verified_at = Some(Utc::now());

        if state.pending.is_empty() {
            debug!(preserved = state.preserved.len(), "Memorial integrity intact");
            IntegrityStatus::Intact
        } else {
            let attempts: u32 = state.pending.values().map(|p| p.attempts).sum();
            warn!(
                pending = state.pending.len(),
                attempts,
                "Memorial integrity degraded, retries outstanding"
            );
            IntegrityStatus::Degraded
        }
    }

    /// Run [`verify_integrity`](Self::verify_integrity) every `period`,
    /// replacing any previous monitor.
    pub fn spawn_integrity_monitor(&self, period: Duration) {
        let protector = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                protector.verify_integrity();
            }
        });

        let mut state = lock(&self.inner.state);
        if let Some(previous) = state.integrity_monitor.replace(handle) {
            previous.abort();
        }
    }

    pub fn status(&self) -> MemorialStatus {
        let state = lock(&self.inner.state);
        MemorialStatus {
            preserved_count: state.preserved.len(),
            pending_retries: state.pending.len(),
            integrity_status: if state.pending.is_empty() {
                IntegrityStatus::Intact
            } else {
                IntegrityStatus::Degraded
            },
            last_verified_at: state.last_verified_at,
        }
    }

    pub fn is_preserved(&self, id: &ConnectionId) -> bool {
        lock(&self.inner.state).preserved.contains(id)
    }

    /// Connections still waiting for a successful write.
    pub fn pending_connections(&self) -> Vec<PrayerConnection> {
        lock(&self.inner.state)
            .pending
            .values()
            .map(|p| p.connection.clone())
            .collect()
    }

    /// Lines that became durable, including those preserved by a retry.
    pub fn subscribe_preserved(&self) -> broadcast::Receiver<PrayerConnection> {
        self.inner.preserved_tx.subscribe()
    }

    /// Stop every retry worker and the integrity monitor.
    ///
    /// Returns the lines that were still unpreserved. They stay in the
    /// pending set, so [`status`](Self::status) keeps reporting them.
    pub fn shutdown(&self) -> Vec<PrayerConnection> {
        let mut state = lock(&self.inner.state);
        if let Some(monitor) = state.integrity_monitor.take() {
            monitor.abort();
        }

        let mut unpreserved = Vec::with_capacity(state.pending.len());
        for pending in state.pending.values_mut() {
            if let Some(worker) = pending.worker.take() {
                worker.abort();
            }
            unpreserved.push(pending.connection.clone());
        }

        if !unpreserved.is_empty() {
            error!(
                count = unpreserved.len(),
                "Memorial protector stopped with unpreserved lines"
            );
        }
        unpreserved
    }

    /// One write attempt. `from_worker` is set when called by the retry
    /// worker itself, which must not abort its own handle.
    async fn attempt(&self, connection: &PrayerConnection, from_worker: bool) -> Result<()> {
        let result = self.inner.store.create_connection(connection).await;

        let mut state = lock(&self.inner.state);
        match result {
            Ok(()) => {
                if let Some(pending) = state.pending.remove(&connection.id) {
                    if let Some(worker) = pending.worker {
                        if !from_worker {
                            worker.abort();
                        }
                    }
                    info!(
                        connection = %connection.id,
                        attempts = pending.attempts + 1,
                        "Memorial preserved after retry"
                    );
                }
                if state.preserved.insert(connection.id) {
                    info!(
                        connection = %connection.id,
                        preserved = state.preserved.len(),
                        "Memorial line preserved"
                    );
                    // Nobody listening is fine.
                    let _ = self.inner.preserved_tx.send(connection.clone());
                }
                Ok(())
            }
            Err(e) => {
                if let Some(pending) = state.pending.get_mut(&connection.id) {
                    pending.attempts += 1;
                } else {
                    state.pending.insert(
                        connection.id,
                        PendingMemorial {
                            connection: connection.clone(),
                            attempts: 1,
                            worker: None,
                        },
                    );
                }
                Err(e)
            }
        }
    }
}

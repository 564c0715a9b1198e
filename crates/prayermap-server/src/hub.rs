//! In-process fan-out of realtime events.
//!
//! [`EventHub`] is the server's [`MessagingChannel`]: every published event
//! goes to a `tokio::sync::broadcast` channel that subscribers (the presence
//! observer, future websocket sessions) read from. In efficient mode routine
//! presence churn is dropped at the source; everything else still flows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use prayermap_realtime::{MessagingChannel, Result};
use prayermap_shared::RealtimeEvent;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub efficient_mode: bool,
    pub published: u64,
    pub suppressed: u64,
    pub subscribers: usize,
}

struct Inner {
    tx: broadcast::Sender<RealtimeEvent>,
    efficient: AtomicBool,
    published: AtomicU64,
    suppressed: AtomicU64,
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                tx,
                efficient: AtomicBool::new(false),
                published: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.tx.subscribe()
    }

    pub fn is_efficient(&self) -> bool {
        self.inner.efficient.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            efficient_mode: self.is_efficient(),
            published: self.inner.published.load(Ordering::Relaxed),
            suppressed: self.inner.suppressed.load(Ordering::Relaxed),
            subscribers: self.inner.tx.receiver_count(),
        }
    }
}

#[async_trait]
impl MessagingChannel for EventHub {
    fn enable_efficient_mode(&self) {
        if !self.inner.efficient.swap(true, Ordering::Relaxed) {
            info!("Event hub switched to efficient mode");
        }
    }

    fn disable_efficient_mode(&self) {
        if self.inner.efficient.swap(false, Ordering::Relaxed) {
            info!("Event hub back to full fan-out");
        }
    }

    async fn send(&self, event: RealtimeEvent) -> Result<()> {
        if self.is_efficient() && matches!(event, RealtimeEvent::PresenceChanged(_)) {
            self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(event = event.event_name(), "Suppressed in efficient mode");
            return Ok(());
        }

        let name = event.event_name();
        match self.inner.tx.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "Event published"),
            Err(_) => debug!(event = name, "Event published with no subscribers"),
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

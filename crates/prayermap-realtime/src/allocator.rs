//! Coarse per-class resource allocation.
//!
//! Allocations are percentages held only in memory. Map updates take the
//! whole channel on demand; messaging has to wait until they let go.

use std::collections::HashMap;

use tracing::{debug, info};

use prayermap_shared::constants::MAP_UPDATE_BUSY_THRESHOLD_PCT;
use prayermap_shared::PriorityClass;

/// Share granted to each class when its allocation is approved.
fn default_share(class: PriorityClass) -> u8 {
    match class {
        PriorityClass::MapUpdate => 100,
        PriorityClass::MemorialLine => 50,
        PriorityClass::Messaging => 30,
        PriorityClass::BackgroundSync => 10,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceAllocator {
    allocations: HashMap<PriorityClass, u8>,
}

impl ResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an allocation for `class`.
    ///
    /// Map updates are preemptive and always granted at 100%. Other classes
    /// are granted while map updates sit below the busy threshold; classes
    /// weighted at least as high as memorial lines win the tie-break and are
    /// granted regardless.
    pub fn allocate_for_priority_class(&mut self, class: PriorityClass) -> bool {
        if class == PriorityClass::MapUpdate {
            self.allocations.insert(class, 100);
            debug!(class = %class, "Preemptive allocation granted");
            return true;
        }

        let granted = !self.map_update_busy()
            || class.weight() >= PriorityClass::MemorialLine.weight();
        if granted {
            self.allocations.insert(class, default_share(class));
        }
        debug!(class = %class, granted, "Allocation requested");
        granted
    }

    /// Messaging is only granted while map updates are below the busy threshold.
    pub fn allocate_for_messaging(&mut self) -> bool {
        self.allocate_for_priority_class(PriorityClass::Messaging)
    }

    pub fn release(&mut self, class: PriorityClass) {
        if self.allocations.remove(&class).is_some() {
            debug!(class = %class, "Allocation released");
        }
    }

    /// Drop messaging and background-sync allocations entirely.
    pub fn free_non_critical_resources(&mut self) {
        let before = self.allocations.len();
        self.allocations.retain(|class, _| !class.is_non_critical());
        let freed = before - self.allocations.len();
        info!(freed, "Freed non-critical allocations");
    }

    /// Current allocation percentage for `class` (0 when unallocated).
    pub fn allocation(&self, class: PriorityClass) -> u8 {
        self.allocations.get(&class).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<PriorityClass, u8> {
        self.allocations.clone()
    }

    pub fn clear(&mut self) {
        self.allocations.clear();
    }

    fn map_update_busy(&self) -> bool {
        self.allocation(PriorityClass::MapUpdate) >= MAP_UPDATE_BUSY_THRESHOLD_PCT
    }
}

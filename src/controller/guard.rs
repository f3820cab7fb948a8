//! Per-vehicle in-tick guard: at most one decision cycle per VIN at a time.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub trait TickGuard: Send + Sync {
    /// Marks `vin` as in tick. Returns `None` while a previous cycle still holds it.
    fn try_acquire(&self, vin: &str) -> Option<TickLease>;
    fn is_in_tick(&self, vin: &str) -> bool;
}

/// Mutex-protected set of VINs currently in tick.
#[derive(Debug, Clone, Default)]
pub struct InTickSet {
    vins: Arc<Mutex<HashSet<String>>>,
}

impl InTickSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vins.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vins.lock().is_empty()
    }
}

impl TickGuard for InTickSet {
    fn try_acquire(&self, vin: &str) -> Option<TickLease> {
        if !self.vins.lock().insert(vin.to_string()) {
            return None;
        }
        Some(TickLease {
            vins: self.vins.clone(),
            vin: vin.to_string(),
        })
    }

    fn is_in_tick(&self, vin: &str) -> bool {
        self.vins.lock().contains(vin)
    }
}

/// Releases the VIN when dropped, whichever way the cycle ends.
#[derive(Debug)]
pub struct TickLease {
    vins: Arc<Mutex<HashSet<String>>>,
    vin: String,
}

impl TickLease {
    pub fn vin(&self) -> &str {
        &self.vin
    }
}

impl Drop for TickLease {
    fn drop(&mut self) {
        self.vins.lock().remove(&self.vin);
    }
}

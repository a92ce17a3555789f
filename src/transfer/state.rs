//! Per-circle runtime state during a transfer operation

use crate::backend::Backend;
use crate::sharding::Circle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Progress counters for one source backend, advanced atomically
#[derive(Debug, Default)]
pub struct Stats {
    pub database_total: AtomicI32,
    pub database_done: AtomicI32,
    pub measurement_total: AtomicI32,
    pub measurement_done: AtomicI32,
    pub transfer_count: AtomicI32,
    pub in_place_count: AtomicI32,
}

impl Stats {
    pub fn reset(&self) {
        self.database_total.store(0, Ordering::Release);
        self.database_done.store(0, Ordering::Release);
        self.measurement_total.store(0, Ordering::Release);
        self.measurement_done.store(0, Ordering::Release);
        self.transfer_count.store(0, Ordering::Release);
        self.in_place_count.store(0, Ordering::Release);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "database_total": self.database_total.load(Ordering::Acquire),
            "database_done": self.database_done.load(Ordering::Acquire),
            "measurement_total": self.measurement_total.load(Ordering::Acquire),
            "measurement_done": self.measurement_done.load(Ordering::Acquire),
            "transfer_count": self.transfer_count.load(Ordering::Acquire),
            "in_place_count": self.in_place_count.load(Ordering::Acquire),
        })
    }
}

/// Transfer-time view of one circle: the membership snapshot, the
/// advisory `transferring` flag and per-backend progress counters.
pub struct CircleState {
    pub circle_id: usize,
    pub circle: Arc<Circle>,
    transferring: AtomicBool,
    stats: HashMap<String, Arc<Stats>>,
}

impl CircleState {
    pub fn new(circle_id: usize, circle: Arc<Circle>) -> Self {
        let stats = circle
            .backends()
            .iter()
            .map(|be| (be.url.clone(), Arc::new(Stats::default())))
            .collect();
        Self {
            circle_id,
            circle,
            transferring: AtomicBool::new(false),
            stats,
        }
    }

    pub fn get_backend(&self, key: &str) -> Arc<Backend> {
        self.circle.get_backend(key)
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        self.circle.backends()
    }

    pub fn stats(&self, url: &str) -> Arc<Stats> {
        self.stats.get(url).cloned().unwrap_or_default()
    }

    pub fn reset_states(&self) {
        for stats in self.stats.values() {
            stats.reset();
        }
    }

    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::Acquire)
    }

    /// Flip the advisory flag, mirrored onto every backend in the circle
    pub fn set_transferring(&self, on: bool) {
        self.transferring.store(on, Ordering::Release);
        for be in self.circle.backends() {
            be.set_transfer_in(on);
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .stats
            .iter()
            .map(|(url, stats)| (url.clone(), stats.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

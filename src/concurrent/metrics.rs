use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub active: AtomicUsize,
    pub submitted_total: AtomicU64,
    pub rejected_total: AtomicU64,
    pub completed_total: AtomicU64,
    pub panicked_total: AtomicU64,
    pub cancelled_total: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancelled(&self) {
        self.cancelled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self, panicked: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if panicked {
            self.panicked_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn get_rejected(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn get_completed(&self) -> u64 {
        self.completed_total.load(Ordering::Relaxed)
    }

    pub fn get_panicked(&self) -> u64 {
        self.panicked_total.load(Ordering::Relaxed)
    }

    pub fn get_cancelled(&self) -> u64 {
        self.cancelled_total.load(Ordering::Relaxed)
    }
}

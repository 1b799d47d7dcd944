use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use courier_types::NonDeliveryReason;

/// Counters for non-delivery results observed by the sender, updated for
/// every non-delivery regardless of whether a handler consumed it.
#[derive(Default)]
pub struct NonDeliveryStats {
    total: AtomicU64,
    by_reason: DashMap<NonDeliveryReason, u64>,
}

impl NonDeliveryStats {
    pub fn record(&self, reason: NonDeliveryReason) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn count(&self, reason: NonDeliveryReason) -> u64 {
        self.by_reason.get(&reason).map(|count| *count).unwrap_or(0)
    }
}

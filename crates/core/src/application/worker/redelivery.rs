// In-process redelivery tracker
//
// Counts failed deliveries per correlation id for brokers that do not send
// `x-delivery-count`. Bounded; the oldest entries are evicted first.

use crate::domain::CorrelationId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct Entries {
    attempts: HashMap<CorrelationId, u32>,
    order: VecDeque<CorrelationId>,
}

pub struct RedeliveryTracker {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl RedeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record a failed delivery and return how many deliveries have failed so far.
    ///
    /// `delivery_count` is the broker's count of previous deliveries, when known;
    /// the larger of both counts wins.
    pub fn record_failure(&self, id: &CorrelationId, delivery_count: Option<u32>) -> u32 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let tracked = entries.attempts.get(id).copied().unwrap_or(0) + 1;
        let from_broker = delivery_count.map(|n| n + 1).unwrap_or(0);
        let attempts = tracked.max(from_broker);

        if entries.attempts.insert(id.clone(), attempts).is_none() {
            entries.order.push_back(id.clone());
            while entries.order.len() > self.capacity {
                if let Some(oldest) = entries.order.pop_front() {
                    entries.attempts.remove(&oldest);
                }
            }
        }
        attempts
    }

    /// Drop the count once the message was settled for good
    pub fn forget(&self, id: &CorrelationId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.attempts.remove(id).is_some() {
            entries.order.retain(|tracked| tracked != id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.attempts.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

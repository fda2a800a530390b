//! 服务端累计计数器。

use common_models::enums::HubCloseCode;
use common_models::management::HubStats;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StatsCounters {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_closed: AtomicU64,
    rejected_by_reason: DashMap<HubCloseCode, u64>,
    heartbeat_timeouts: AtomicU64,
    broadcasts: AtomicU64,
    messages_delivered: AtomicU64,
    backpressure_drops: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: HubCloseCode) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        *self.rejected_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self, delivered: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.messages_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub fn record_drops(&self, count: u64) {
        if count > 0 {
            self.backpressure_drops.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.backpressure_drops.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HubStats {
        HubStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            rejected_by_reason: self
                .rejected_by_reason
                .iter()
                .map(|e| (e.key().name().to_string(), *e.value()))
                .collect(),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
        }
    }
}

//! Process-wide sync counters.
//!
//! A single static sink of monotonic counters, shared by every peer and
//! stream. Counters only ever increase; read them with [`snapshot`] for
//! logs and tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Metrics {
    /// OfferedHashes messages emitted by local servers.
    pub offers_sent: AtomicU64,
    /// WantedHashes messages handled by local servers.
    pub wants_received: AtomicU64,
    /// ChunkDelivery messages emitted by local servers.
    pub chunks_delivered: AtomicU64,
    /// ChunkDelivery messages stored by local clients.
    pub chunks_received: AtomicU64,
    /// Client batch watchdogs that fired.
    pub batch_timeouts: AtomicU64,
    /// Peers dropped for any reason.
    pub peers_dropped: AtomicU64,
    /// SubscribeError messages sent or received.
    pub subscribe_errors: AtomicU64,
}

static METRICS: Metrics = Metrics {
    offers_sent: AtomicU64::new(0),
    wants_received: AtomicU64::new(0),
    chunks_delivered: AtomicU64::new(0),
    chunks_received: AtomicU64::new(0),
    batch_timeouts: AtomicU64::new(0),
    peers_dropped: AtomicU64::new(0),
    subscribe_errors: AtomicU64::new(0),
};

/// The process-wide metrics sink.
pub fn global() -> &'static Metrics {
    &METRICS
}

/// Increment a counter by one.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub offers_sent: u64,
    pub wants_received: u64,
    pub chunks_delivered: u64,
    pub chunks_received: u64,
    pub batch_timeouts: u64,
    pub peers_dropped: u64,
    pub subscribe_errors: u64,
}

pub fn snapshot() -> Snapshot {
    let m = global();
    Snapshot {
        offers_sent: m.offers_sent.load(Ordering::Relaxed),
        wants_received: m.wants_received.load(Ordering::Relaxed),
        chunks_delivered: m.chunks_delivered.load(Ordering::Relaxed),
        chunks_received: m.chunks_received.load(Ordering::Relaxed),
        batch_timeouts: m.batch_timeouts.load(Ordering::Relaxed),
        peers_dropped: m.peers_dropped.load(Ordering::Relaxed),
        subscribe_errors: m.subscribe_errors.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let before = snapshot().offers_sent;
        incr(&global().offers_sent);
        incr(&global().offers_sent);
        assert!(snapshot().offers_sent >= before + 2);
    }
}

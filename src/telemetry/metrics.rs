//! Counters for the receive and replay paths.
//!
//! The hot paths run on a single thread, but the counters are atomic so
//! a monitoring thread may read them without coordination.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Statistics for one live receiver.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    /// `recvmmsg` calls that returned at least zero messages.
    pub rx_batches: Counter,
    /// Datagrams dispatched to handlers.
    pub rx_packets: Counter,
    /// Payload bytes dispatched.
    pub rx_bytes: Counter,
    /// Datagrams flagged `MSG_TRUNC` by the kernel.
    pub rx_truncated: Counter,
}

/// Statistics for one capture replayer.
#[derive(Debug, Default)]
pub struct ReplayStats {
    /// Packets dispatched to handlers.
    pub packets_delivered: Counter,
    /// Packets silently dropped: capture truncation, parse failures,
    /// unknown interfaces, unsubscribed ports.
    pub packets_dropped: Counter,
    /// Payload bytes dispatched.
    pub bytes_delivered: Counter,
}

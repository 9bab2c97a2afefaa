//! Per-channel traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Monotonic counters for one channel. The read loop is the only
/// writer on the receive side, the write path the only writer on the
/// send side; readers may observe slightly stale values.
#[derive(Debug, Default)]
pub struct ChannelStatistics {
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    send_failures: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    receive_failures: AtomicU64,
    last_sent: Mutex<Option<Instant>>,
    last_received: Mutex<Option<Instant>>,
}

impl ChannelStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_send(&self, bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
        *self.last_sent.lock() = Some(Instant::now());
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_receive(&self, bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
        *self.last_received.lock() = Some(Instant::now());
    }

    pub(crate) fn record_receive_failure(&self) {
        self.receive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn receive_failures(&self) -> u64 {
        self.receive_failures.load(Ordering::Relaxed)
    }

    pub fn last_sent(&self) -> Option<Instant> {
        *self.last_sent.lock()
    }

    pub fn last_received(&self) -> Option<Instant> {
        *self.last_received.lock()
    }

    /// Log-friendly send-side summary.
    pub fn send_summary(&self) -> String {
        format!(
            "sent {} msgs / {} bytes, {} failures",
            self.sent_messages(),
            self.sent_bytes(),
            self.send_failures(),
        )
    }

    /// Log-friendly receive-side summary.
    pub fn receive_summary(&self) -> String {
        format!(
            "received {} msgs / {} bytes, {} failures",
            self.received_messages(),
            self.received_bytes(),
            self.receive_failures(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = ChannelStatistics::new();
        stats.record_receive(5);
        stats.record_receive(7);
        stats.record_receive_failure();
        stats.record_send(3);

        assert_eq!(stats.received_messages(), 2);
        assert_eq!(stats.received_bytes(), 12);
        assert_eq!(stats.receive_failures(), 1);
        assert_eq!(stats.sent_messages(), 1);
        assert_eq!(stats.sent_bytes(), 3);
        assert!(stats.last_received().is_some());
        assert!(stats.last_sent().is_some());
        assert!(stats.receive_summary().contains("2 msgs"));
    }
}

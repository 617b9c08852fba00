//! Counters for the NATS handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct NatsMetrics {
    /// Total messages published.
    pub messages_published: AtomicU64,
    /// Total requests received.
    pub messages_received: AtomicU64,
    /// Total publish failures.
    pub publish_failures: AtomicU64,
    /// Requests that could not be decoded.
    pub decode_failures: AtomicU64,
    /// Responses replaced because they were too large.
    pub oversized_responses: AtomicU64,
    /// Total reconnections.
    pub reconnect_attempts: AtomicU64,
    /// Current connection state (0 = disconnected, 1 = connected).
    pub connected: AtomicU64,
    /// Total bytes published.
    pub bytes_published: AtomicU64,
    /// Total bytes received.
    pub bytes_received: AtomicU64,
}

impl NatsMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, bytes: u64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized_response(&self) {
        self.oversized_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            oversized_responses: self.oversized_responses.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed) == 1,
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub messages_received: u64,
    pub publish_failures: u64,
    pub decode_failures: u64,
    pub oversized_responses: u64,
    pub reconnect_attempts: u64,
    pub connected: bool,
    pub bytes_published: u64,
    pub bytes_received: u64,
}

/// Timer for measuring request handling latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = NatsMetrics::new();
        metrics.record_publish(10);
        metrics.record_publish(5);
        metrics.record_receive(7);
        metrics.record_decode_failure();
        metrics.set_connected(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 15);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.decode_failures, 1);
        assert!(snapshot.connected);
    }
}

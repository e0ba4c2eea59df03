//! Session counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Atomic packet and drop counters plus the jitter buffer fill gauge.
///
/// Drops are counted per rejected call: one datagram or one capture frame
/// that could not be buffered is one drop, whatever its size.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    tx_drops: AtomicU64,
    rx_drops: AtomicU64,
    buffer_fill: AtomicUsize,
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_drops: u64,
    pub rx_drops: u64,
    pub buffer_fill: usize,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tx_packet(&self) -> u64 {
        self.tx_packets.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_rx_packet(&self) -> u64 {
        self.rx_packets.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_tx_drop(&self) {
        self.tx_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx_drop(&self) {
        self.rx_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_buffer_fill(&self, bytes: usize) {
        self.buffer_fill.store(bytes, Ordering::Relaxed);
    }

    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    pub fn tx_drops(&self) -> u64 {
        self.tx_drops.load(Ordering::Relaxed)
    }

    pub fn rx_drops(&self) -> u64 {
        self.rx_drops.load(Ordering::Relaxed)
    }

    pub fn buffer_fill(&self) -> usize {
        self.buffer_fill.load(Ordering::Relaxed)
    }

    /// Zero all counters and the gauge
    pub fn reset(&self) {
        self.tx_packets.store(0, Ordering::Relaxed);
        self.rx_packets.store(0, Ordering::Relaxed);
        self.tx_drops.store(0, Ordering::Relaxed);
        self.rx_drops.store(0, Ordering::Relaxed);
        self.buffer_fill.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tx_packets: self.tx_packets(),
            rx_packets: self.rx_packets(),
            tx_drops: self.tx_drops(),
            rx_drops: self.rx_drops(),
            buffer_fill: self.buffer_fill(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let metrics = SessionMetrics::new();
        assert_eq!(metrics.record_tx_packet(), 1);
        assert_eq!(metrics.record_tx_packet(), 2);
        metrics.record_rx_packet();
        metrics.record_tx_drop();
        metrics.record_rx_drop();
        metrics.record_rx_drop();
        metrics.set_buffer_fill(1024);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tx_packets, 2);
        assert_eq!(snapshot.rx_packets, 1);
        assert_eq!(snapshot.tx_drops, 1);
        assert_eq!(snapshot.rx_drops, 2);
        assert_eq!(snapshot.buffer_fill, 1024);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}

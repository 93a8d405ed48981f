use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine-wide traffic counters.
pub struct EngineStats {
    /// Bytes of accepted frames read from the device.
    outbound_bytes: AtomicU64,
    /// Bytes of frames written back to the device.
    inbound_bytes: AtomicU64,
    /// Frames dropped by validation or a full write queue.
    dropped_packets: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    /// RSTs synthesised for packets of unknown flows.
    stray_resets: AtomicU64,
}

/// Snapshot of engine statistics for serialization.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub outbound_bytes: u64,
    pub inbound_bytes: u64,
    pub dropped_packets: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub stray_resets: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            outbound_bytes: AtomicU64::new(0),
            inbound_bytes: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            stray_resets: AtomicU64::new(0),
        }
    }

    pub fn record_outbound(&self, bytes: usize) {
        self.outbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_inbound(&self, bytes: usize) {
        self.inbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stray_reset(&self) {
        self.stray_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);

        StatsSnapshot {
            outbound_bytes: self.outbound_bytes.load(Ordering::Relaxed),
            inbound_bytes: self.inbound_bytes.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            connections_opened: opened,
            connections_closed: closed,
            active_connections: opened.saturating_sub(closed),
            stray_resets: self.stray_resets.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.outbound_bytes.store(0, Ordering::Relaxed);
        self.inbound_bytes.store(0, Ordering::Relaxed);
        self.dropped_packets.store(0, Ordering::Relaxed);
        self.connections_opened.store(0, Ordering::Relaxed);
        self.connections_closed.store(0, Ordering::Relaxed);
        self.stray_resets.store(0, Ordering::Relaxed);
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = EngineStats::new();
        stats.record_outbound(60);
        stats.record_outbound(40);
        stats.record_inbound(1500);
        stats.record_connection_open();
        stats.record_connection_open();
        stats.record_connection_close();
        stats.record_drop();

        let snap = stats.snapshot();
        assert_eq!(snap.outbound_bytes, 100);
        assert_eq!(snap.inbound_bytes, 1500);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.dropped_packets, 1);

        stats.reset();
        assert_eq!(stats.snapshot().outbound_bytes, 0);
    }
}

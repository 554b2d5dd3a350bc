//! Engine observability counters.
//!
//! Each engine keeps its own counters; nothing is process-global, so engines
//! on different threads never share or contend on them.

use std::time::Instant;
use tracing::info;

/// Counters for one engine
#[derive(Debug)]
pub struct EngineMetrics {
    peers_opened: u64,
    peers_closed: u64,
    connections_accepted: u64,
    handshakes_success: u64,
    handshakes_failed: u64,
    frames_sent: u64,
    frames_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    events_emitted: u64,
    events_dropped: u64,
    timeouts: u64,
    protocol_errors: u64,
    io_errors: u64,
    start_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            peers_opened: 0,
            peers_closed: 0,
            connections_accepted: 0,
            handshakes_success: 0,
            handshakes_failed: 0,
            frames_sent: 0,
            frames_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            events_emitted: 0,
            events_dropped: 0,
            timeouts: 0,
            protocol_errors: 0,
            io_errors: 0,
            start_time: Instant::now(),
        }
    }

    pub fn peer_opened(&mut self) {
        self.peers_opened += 1;
    }

    pub fn peer_closed(&mut self) {
        self.peers_closed += 1;
    }

    pub fn connection_accepted(&mut self) {
        self.connections_accepted += 1;
    }

    pub fn handshake_success(&mut self) {
        self.handshakes_success += 1;
    }

    pub fn handshake_failed(&mut self) {
        self.handshakes_failed += 1;
    }

    /// Record a frame queued for sending
    pub fn frame_sent(&mut self, byte_count: usize) {
        self.frames_sent += 1;
        self.bytes_sent += byte_count as u64;
    }

    /// Record a decoded inbound frame
    pub fn frame_received(&mut self, byte_count: usize) {
        self.frames_received += 1;
        self.bytes_received += byte_count as u64;
    }

    pub fn event_emitted(&mut self) {
        self.events_emitted += 1;
    }

    pub fn events_dropped(&mut self, count: usize) {
        self.events_dropped += count as u64;
    }

    pub fn timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn protocol_error(&mut self) {
        self.protocol_errors += 1;
    }

    pub fn io_error(&mut self) {
        self.io_errors += 1;
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            peers_opened: self.peers_opened,
            peers_active: self.peers_opened.saturating_sub(self.peers_closed),
            peers_closed: self.peers_closed,
            connections_accepted: self.connections_accepted,
            handshakes_success: self.handshakes_success,
            handshakes_failed: self.handshakes_failed,
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            events_emitted: self.events_emitted,
            events_dropped: self.events_dropped,
            timeouts: self.timeouts,
            protocol_errors: self.protocol_errors,
            io_errors: self.io_errors,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            peers_opened = snapshot.peers_opened,
            peers_active = snapshot.peers_active,
            peers_closed = snapshot.peers_closed,
            connections_accepted = snapshot.connections_accepted,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            events_emitted = snapshot.events_emitted,
            events_dropped = snapshot.events_dropped,
            timeouts = snapshot.timeouts,
            protocol_errors = snapshot.protocol_errors,
            io_errors = snapshot.io_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Engine metrics snapshot"
        );
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub peers_opened: u64,
    pub peers_active: u64,
    pub peers_closed: u64,
    pub connections_accepted: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub io_errors: u64,
    pub uptime_seconds: u64,
}

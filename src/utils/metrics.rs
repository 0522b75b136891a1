//! Observability and Metrics
//!
//! Atomic counters describing protocol traffic. A [`Metrics`] value lives in
//! the shared protocol context and is updated by every connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::utils::compression::CompressionMode;

/// Metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused at the connection limit
    pub connections_rejected: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Frames written
    pub frames_sent: AtomicU64,
    /// Frames read
    pub frames_received: AtomicU64,
    /// Frame body bytes written
    pub bytes_sent: AtomicU64,
    /// Frame body bytes read
    pub bytes_received: AtomicU64,
    /// Outbound frames sent uncompressed
    pub frames_uncompressed: AtomicU64,
    /// Outbound frames sent with zlib
    pub frames_deflate: AtomicU64,
    /// Outbound frames sent with bzip2
    pub frames_bzip2: AtomicU64,
    /// Inbound packets with an unregistered id
    pub unknown_packets: AtomicU64,
    /// Sends refused because the outbound queue was full
    pub backpressure_rejections: AtomicU64,
    /// Errors that closed a connection
    pub fatal_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_uncompressed: AtomicU64::new(0),
            frames_deflate: AtomicU64::new(0),
            frames_bzip2: AtomicU64::new(0),
            unknown_packets: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound frame and the compression it used
    pub fn frame_sent(&self, byte_count: u64, mode: CompressionMode) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
        let counter = match mode {
            CompressionMode::None => &self.frames_uncompressed,
            CompressionMode::Deflate => &self.frames_deflate,
            CompressionMode::Bzip2 => &self.frames_bzip2,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn unknown_packet(&self) {
        self.unknown_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure_rejection(&self) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_uncompressed: self.frames_uncompressed.load(Ordering::Relaxed),
            frames_deflate: self.frames_deflate.load(Ordering::Relaxed),
            frames_bzip2: self.frames_bzip2.load(Ordering::Relaxed),
            unknown_packets: self.unknown_packets.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            connections_rejected = s.connections_rejected,
            handshakes_success = s.handshakes_success,
            handshakes_failed = s.handshakes_failed,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            frames_deflate = s.frames_deflate,
            frames_bzip2 = s.frames_bzip2,
            unknown_packets = s.unknown_packets,
            fatal_errors = s.fatal_errors,
            uptime_seconds = s.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_uncompressed: u64,
    pub frames_deflate: u64,
    pub frames_bzip2: u64,
    pub unknown_packets: u64,
    pub backpressure_rejections: u64,
    pub fatal_errors: u64,
    pub uptime_seconds: u64,
}

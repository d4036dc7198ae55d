//! Connection lifecycle notifications and the counters fed by them.

use crate::connection::error::DisconnectReason;
use crate::connection::handle::ConnectionInfo;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives the "started" and "disconnected" notifications of every
/// connection.
///
/// `on_disconnected` fires exactly once per connection that fired
/// `on_started`. Both run on the connection's task and must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_started(&self, _info: &ConnectionInfo) {}

    fn on_disconnected(&self, _info: &ConnectionInfo, _reason: DisconnectReason) {}
}

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests completed by the parser
    pub requests_received: AtomicU64,
    /// Requests that had to wait in the admission queue
    pub requests_queued: AtomicU64,
    /// Requests answered with 503 because the queue was full
    pub requests_rejected: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_queued(&self) {
        self.requests_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl ConnectionObserver for ConnectionStats {
    fn on_started(&self, _info: &ConnectionInfo) {
        self.connection_opened();
    }

    fn on_disconnected(&self, _info: &ConnectionInfo, _reason: DisconnectReason) {
        self.connection_closed();
    }
}

/// Plain copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub requests_received: u64,
    pub requests_queued: u64,
    pub requests_rejected: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

//! Live server counters.
//!
//! Mutated only through atomic operations and read for observability. No
//! control decision is ever taken from these values.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-server counters, shared with [`crate::server::ServerHandle`].
#[derive(Debug, Default)]
pub struct ServerCounters {
    /// Currently open connections
    connected: AtomicUsize,
    /// Bytes received over the server's lifetime
    total_bytes_read: AtomicU64,
    /// Bytes sent over the server's lifetime
    bytes_written: AtomicU64,
    /// Connections accepted over the server's lifetime
    accepted: AtomicU64,
    /// Responses fully sent
    responses: AtomicU64,
}

/// Point-in-time copy of [`ServerCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub connected: usize,
    pub total_bytes_read: u64,
    pub bytes_written: u64,
    pub accepted: u64,
    pub responses: u64,
}

impl ServerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of open connections including this one.
    pub fn connection_opened(&self) -> usize {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.connected.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the number of connections still open.
    pub fn connection_closed(&self) -> usize {
        self.connected.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Returns the new lifetime total.
    pub fn bytes_read(&self, count: usize) -> u64 {
        self.total_bytes_read
            .fetch_add(count as u64, Ordering::Relaxed)
            + count as u64
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn response_sent(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            total_bytes_read: self.total_bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_lifecycle() {
        let counters = ServerCounters::new();

        assert_eq!(counters.connection_opened(), 1);
        assert_eq!(counters.connection_opened(), 2);
        assert_eq!(counters.bytes_read(5), 5);
        assert_eq!(counters.bytes_read(7), 12);
        counters.bytes_written(7);
        counters.response_sent();
        assert_eq!(counters.connection_closed(), 1);

        assert_eq!(
            counters.snapshot(),
            CountersSnapshot {
                connected: 1,
                total_bytes_read: 12,
                bytes_written: 7,
                accepted: 2,
                responses: 1,
            }
        );
    }
}

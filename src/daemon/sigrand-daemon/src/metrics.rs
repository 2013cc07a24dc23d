//! Serve statistics and metrics reporting
//! Follows SRP: Only responsible for counting what the serve loop does

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use sigrand_core::Selection;

/// Counters for the serve loop, mirrored to the `metrics` facade
pub struct ServeStats {
    start_time: Instant,
    connections: AtomicU64,
    entries_scanned: AtomicU64,
    empty_selections: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
}

impl ServeStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections: AtomicU64::new(0),
            entries_scanned: AtomicU64::new(0),
            empty_selections: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Record one pass over the source
    pub fn record_selection(&self, selection: &Selection, elapsed: Duration) {
        counter!("sigrand_entries_scanned_total").increment(selection.seen);
        histogram!("sigrand_selection_duration_seconds").record(elapsed.as_secs_f64());
        self.entries_scanned
            .fetch_add(selection.seen, Ordering::Relaxed);

        if selection.entry.is_none() {
            counter!("sigrand_empty_selections_total").increment(1);
            self.empty_selections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a reader that was served (possibly with zero bytes)
    pub fn record_served(&self, bytes: usize) {
        counter!("sigrand_connections_total").increment(1);
        counter!("sigrand_bytes_written_total").increment(bytes as u64);
        histogram!("sigrand_entry_size_bytes").record(bytes as f64);
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a reader that went away before the entry was written
    pub fn record_write_failure(&self) {
        counter!("sigrand_write_failures_total").increment(1);
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connections: self.connections.load(Ordering::Relaxed),
            entries_scanned: self.entries_scanned.load(Ordering::Relaxed),
            empty_selections: self.empty_selections.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub connections: u64,
    pub entries_scanned: u64,
    pub empty_selections: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
}

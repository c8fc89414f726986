//! Operational counters for the log core.
//!
//! Counters only, monotonic, reset at process start. All increments use
//! relaxed atomics; readers get eventually-consistent exact totals.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter registry for the log, the group-commit coordinator and the
/// session caches.
#[derive(Debug, Default)]
pub struct LogMetrics {
    /// Total bytes appended to the log.
    bytes_written: AtomicU64,
    /// Fsyncs actually issued.
    fsync_count: AtomicU64,
    /// Fsyncs whose latency exceeded the slow threshold.
    fsync_slow: AtomicU64,
    /// Cumulative fsync latency in microseconds.
    fsync_micros: AtomicU64,
    /// Commits whose durability was served by another session's fsync.
    fsyncs_grouped: AtomicU64,
    /// Fsyncs issued after sleeping for a batch.
    fsyncs_group_leader: AtomicU64,
    /// Fsyncs issued immediately, without batching.
    fsyncs_solo: AtomicU64,
    /// Commits that were not eligible for ticket ordering.
    ordering_skipped: AtomicU64,
    /// Completed waits for commit-order tickets.
    ticket_waits: AtomicU64,
    /// Cumulative ticket-wait time in microseconds.
    ticket_wait_micros: AtomicU64,
    /// Ticket waits that ran close to or past the one-second budget.
    ticket_long_waits: AtomicU64,
    /// Times group commit was disabled for the process.
    group_commit_disables: AtomicU64,
    /// Transactions that used a session cache.
    cache_uses: AtomicU64,
    /// Transactions whose cache spilled to its temporary file.
    cache_spills: AtomicU64,
    /// Incident events written.
    incidents_written: AtomicU64,
    /// Log files rotated.
    rotations: AtomicU64,
    /// Log files removed by purge.
    logs_purged: AtomicU64,
    /// Waits for a free page or for rotation in the XID logs.
    page_waits: AtomicU64,
    /// Sessions currently holding a prepared XID record (gauge-like,
    /// but only ever incremented/decremented by the 2PC surface).
    prepared_xids_logged: AtomicU64,
}

impl LogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    // Fsync accounting

    /// Record one issued fsync with its latency.
    pub fn record_fsync(&self, micros: u64, slow_threshold_micros: u64) {
        self.fsync_count.fetch_add(1, Ordering::Relaxed);
        self.fsync_micros.fetch_add(micros, Ordering::Relaxed);
        if slow_threshold_micros > 0 && micros >= slow_threshold_micros {
            self.fsync_slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn fsync_count(&self) -> u64 {
        self.fsync_count.load(Ordering::Relaxed)
    }

    pub fn fsync_slow(&self) -> u64 {
        self.fsync_slow.load(Ordering::Relaxed)
    }

    pub fn fsync_micros(&self) -> u64 {
        self.fsync_micros.load(Ordering::Relaxed)
    }

    pub fn increment_fsyncs_grouped(&self) {
        self.fsyncs_grouped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fsyncs_grouped(&self) -> u64 {
        self.fsyncs_grouped.load(Ordering::Relaxed)
    }

    pub fn increment_fsyncs_group_leader(&self) {
        self.fsyncs_group_leader.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fsyncs_group_leader(&self) -> u64 {
        self.fsyncs_group_leader.load(Ordering::Relaxed)
    }

    pub fn increment_fsyncs_solo(&self) {
        self.fsyncs_solo.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fsyncs_solo(&self) -> u64 {
        self.fsyncs_solo.load(Ordering::Relaxed)
    }

    // Ticket accounting

    pub fn increment_ordering_skipped(&self) {
        self.ordering_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ticket_wait(&self, micros: u64) {
        self.ticket_waits.fetch_add(1, Ordering::Relaxed);
        self.ticket_wait_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn ticket_waits(&self) -> u64 {
        self.ticket_waits.load(Ordering::Relaxed)
    }

    pub fn ticket_wait_micros(&self) -> u64 {
        self.ticket_wait_micros.load(Ordering::Relaxed)
    }

    pub fn increment_ticket_long_waits(&self) {
        self.ticket_long_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticket_long_waits(&self) -> u64 {
        self.ticket_long_waits.load(Ordering::Relaxed)
    }

    pub fn increment_group_commit_disables(&self) {
        self.group_commit_disables.fetch_add(1, Ordering::Relaxed);
    }

    pub fn group_commit_disables(&self) -> u64 {
        self.group_commit_disables.load(Ordering::Relaxed)
    }

    // Cache accounting

    pub fn increment_cache_uses(&self) {
        self.cache_uses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_uses(&self) -> u64 {
        self.cache_uses.load(Ordering::Relaxed)
    }

    pub fn increment_cache_spills(&self) {
        self.cache_spills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_spills(&self) -> u64 {
        self.cache_spills.load(Ordering::Relaxed)
    }

    // Log lifecycle

    pub fn increment_incidents(&self) {
        self.incidents_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incidents_written(&self) -> u64 {
        self.incidents_written.load(Ordering::Relaxed)
    }

    pub fn increment_rotations(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn add_logs_purged(&self, count: u64) {
        self.logs_purged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn logs_purged(&self) -> u64 {
        self.logs_purged.load(Ordering::Relaxed)
    }

    pub fn increment_page_waits(&self) {
        self.page_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_waits(&self) -> u64 {
        self.page_waits.load(Ordering::Relaxed)
    }

    pub fn increment_prepared_logged(&self) {
        self.prepared_xids_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_prepared_logged(&self) {
        self.prepared_xids_logged.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn prepared_xids_logged(&self) -> u64 {
        self.prepared_xids_logged.load(Ordering::Relaxed)
    }
}

/// Microsecond latency threshold past which an fsync counts as slow.
pub const SLOW_FSYNC_MICROS: u64 = 100_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = LogMetrics::new();
        assert_eq!(metrics.fsync_count(), 0);
        assert_eq!(metrics.ticket_waits(), 0);
        assert_eq!(metrics.cache_uses(), 0);
    }

    #[test]
    fn test_fsync_slow_classification() {
        let metrics = LogMetrics::new();
        metrics.record_fsync(50, 100);
        metrics.record_fsync(150, 100);
        metrics.record_fsync(100, 100);

        assert_eq!(metrics.fsync_count(), 3);
        assert_eq!(metrics.fsync_slow(), 2);
        assert_eq!(metrics.fsync_micros(), 300);
    }

    #[test]
    fn test_slow_threshold_zero_disables_classification() {
        let metrics = LogMetrics::new();
        metrics.record_fsync(1_000_000, 0);
        assert_eq!(metrics.fsync_slow(), 0);
    }

    #[test]
    fn test_prepared_gauge_round_trip() {
        let metrics = LogMetrics::new();
        metrics.increment_prepared_logged();
        metrics.increment_prepared_logged();
        metrics.decrement_prepared_logged();
        assert_eq!(metrics.prepared_xids_logged(), 1);
    }
}

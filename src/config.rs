//! Runtime configuration for the replication log core.
//!
//! Every option here is mutable at runtime unless noted. Sessions read
//! options through relaxed atomic loads so an operator change is picked
//! up by the next operation without any lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Default rotation threshold: 1 GiB.
pub const DEFAULT_MAX_LOG_SIZE: u64 = 1024 * 1024 * 1024;

/// Default soft cap before a session cache spills to disk: 32 KiB.
pub const DEFAULT_CACHE_SIZE: u64 = 32 * 1024;

/// Default hard cap on a session cache: 4 GiB.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Configuration for the log, the session caches and group commit.
#[derive(Debug)]
pub struct LogConfig {
    /// Server identifier stamped into every event header. At-startup.
    server_id: AtomicU32,
    /// Rotate the active log file once it reaches this many bytes.
    max_log_size: AtomicU64,
    /// Fsync the log every N commits. 0 disables fsync entirely.
    sync_period: AtomicU64,
    /// Purge log files older than this many days after each rotation.
    /// 0 disables time-based purge.
    expire_days: AtomicU64,
    /// Soft cap on a session cache; beyond it the cache spills to a
    /// temporary file.
    cache_size: AtomicU64,
    /// Hard cap on a session cache; exceeding it fails the statement
    /// with a cache-full error.
    max_cache_size: AtomicU64,
    /// Whether ticket-ordered group commit is attempted at all.
    group_commit_enabled: AtomicBool,
    /// Minimum concurrent commits before the batched fsync path is taken.
    group_commit_min_batch: AtomicU64,
    /// Maximum microseconds a session sleeps collecting a batch.
    group_commit_timeout_usec: AtomicU64,
    /// Ticket waits longer than this many seconds produce a diagnostic.
    group_commit_hang_log_sec: AtomicU64,
    /// Ticket waits longer than this many seconds disable group commit
    /// for the rest of the process lifetime.
    group_commit_hang_disable_sec: AtomicU64,
    /// Whether non-transactional updates bypass the session cache and go
    /// straight to the log.
    direct_non_trans_update: AtomicBool,
    /// Force log emission for rollbacks even when only transactional
    /// state was touched.
    keep_log: AtomicBool,
}

/// Point-in-time copy of the configuration, for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogConfigSnapshot {
    pub server_id: u32,
    pub max_log_size: u64,
    pub sync_period: u64,
    pub expire_days: u64,
    pub cache_size: u64,
    pub max_cache_size: u64,
    pub group_commit_enabled: bool,
    pub group_commit_min_batch: u64,
    pub group_commit_timeout_usec: u64,
    pub group_commit_hang_log_sec: u64,
    pub group_commit_hang_disable_sec: u64,
    pub direct_non_trans_update: bool,
    pub keep_log: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            server_id: AtomicU32::new(1),
            max_log_size: AtomicU64::new(DEFAULT_MAX_LOG_SIZE),
            sync_period: AtomicU64::new(1),
            expire_days: AtomicU64::new(0),
            cache_size: AtomicU64::new(DEFAULT_CACHE_SIZE),
            max_cache_size: AtomicU64::new(DEFAULT_MAX_CACHE_SIZE),
            group_commit_enabled: AtomicBool::new(true),
            group_commit_min_batch: AtomicU64::new(4),
            group_commit_timeout_usec: AtomicU64::new(1000),
            group_commit_hang_log_sec: AtomicU64::new(10),
            group_commit_hang_disable_sec: AtomicU64::new(60),
            direct_non_trans_update: AtomicBool::new(false),
            keep_log: AtomicBool::new(false),
        }
    }
}

impl LogConfig {
    pub fn new(server_id: u32) -> Self {
        let config = Self::default();
        config.server_id.store(server_id, Ordering::Relaxed);
        config
    }

    pub fn server_id(&self) -> u32 {
        self.server_id.load(Ordering::Relaxed)
    }

    pub fn max_log_size(&self) -> u64 {
        self.max_log_size.load(Ordering::Relaxed)
    }

    pub fn set_max_log_size(&self, bytes: u64) {
        self.max_log_size.store(bytes, Ordering::Relaxed);
    }

    pub fn sync_period(&self) -> u64 {
        self.sync_period.load(Ordering::Relaxed)
    }

    pub fn set_sync_period(&self, period: u64) {
        self.sync_period.store(period, Ordering::Relaxed);
    }

    pub fn expire_days(&self) -> u64 {
        self.expire_days.load(Ordering::Relaxed)
    }

    pub fn set_expire_days(&self, days: u64) {
        self.expire_days.store(days, Ordering::Relaxed);
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::Relaxed)
    }

    pub fn set_cache_size(&self, bytes: u64) {
        self.cache_size.store(bytes, Ordering::Relaxed);
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size.load(Ordering::Relaxed)
    }

    pub fn set_max_cache_size(&self, bytes: u64) {
        self.max_cache_size.store(bytes, Ordering::Relaxed);
    }

    pub fn group_commit_enabled(&self) -> bool {
        self.group_commit_enabled.load(Ordering::Relaxed)
    }

    pub fn set_group_commit_enabled(&self, enabled: bool) {
        self.group_commit_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn group_commit_min_batch(&self) -> u64 {
        self.group_commit_min_batch.load(Ordering::Relaxed)
    }

    pub fn set_group_commit_min_batch(&self, min: u64) {
        self.group_commit_min_batch.store(min, Ordering::Relaxed);
    }

    pub fn group_commit_timeout_usec(&self) -> u64 {
        self.group_commit_timeout_usec.load(Ordering::Relaxed)
    }

    pub fn set_group_commit_timeout_usec(&self, usec: u64) {
        self.group_commit_timeout_usec.store(usec, Ordering::Relaxed);
    }

    pub fn group_commit_hang_log_sec(&self) -> u64 {
        self.group_commit_hang_log_sec.load(Ordering::Relaxed)
    }

    pub fn set_group_commit_hang_log_sec(&self, sec: u64) {
        self.group_commit_hang_log_sec.store(sec, Ordering::Relaxed);
    }

    pub fn group_commit_hang_disable_sec(&self) -> u64 {
        self.group_commit_hang_disable_sec.load(Ordering::Relaxed)
    }

    pub fn set_group_commit_hang_disable_sec(&self, sec: u64) {
        self.group_commit_hang_disable_sec.store(sec, Ordering::Relaxed);
    }

    pub fn direct_non_trans_update(&self) -> bool {
        self.direct_non_trans_update.load(Ordering::Relaxed)
    }

    pub fn set_direct_non_trans_update(&self, direct: bool) {
        self.direct_non_trans_update.store(direct, Ordering::Relaxed);
    }

    pub fn keep_log(&self) -> bool {
        self.keep_log.load(Ordering::Relaxed)
    }

    pub fn set_keep_log(&self, keep: bool) {
        self.keep_log.store(keep, Ordering::Relaxed);
    }

    /// Capture the current values for diagnostics.
    pub fn snapshot(&self) -> LogConfigSnapshot {
        LogConfigSnapshot {
            server_id: self.server_id(),
            max_log_size: self.max_log_size(),
            sync_period: self.sync_period(),
            expire_days: self.expire_days(),
            cache_size: self.cache_size(),
            max_cache_size: self.max_cache_size(),
            group_commit_enabled: self.group_commit_enabled(),
            group_commit_min_batch: self.group_commit_min_batch(),
            group_commit_timeout_usec: self.group_commit_timeout_usec(),
            group_commit_hang_log_sec: self.group_commit_hang_log_sec(),
            group_commit_hang_disable_sec: self.group_commit_hang_disable_sec(),
            direct_non_trans_update: self.direct_non_trans_update(),
            keep_log: self.keep_log(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.max_log_size(), DEFAULT_MAX_LOG_SIZE);
        assert_eq!(config.sync_period(), 1);
        assert_eq!(config.expire_days(), 0);
        assert!(config.group_commit_enabled());
        assert!(!config.keep_log());
    }

    #[test]
    fn test_runtime_mutation_visible_through_snapshot() {
        let config = LogConfig::new(7);
        config.set_max_log_size(4096);
        config.set_sync_period(0);
        config.set_keep_log(true);

        let snap = config.snapshot();
        assert_eq!(snap.server_id, 7);
        assert_eq!(snap.max_log_size, 4096);
        assert_eq!(snap.sync_period, 0);
        assert!(snap.keep_log);
    }

    #[test]
    fn test_snapshot_serializes() {
        let config = LogConfig::new(3);
        let json = serde_json::to_value(config.snapshot()).unwrap();
        assert_eq!(json["server_id"], 3);
        assert_eq!(json["group_commit_min_batch"], 4);
    }
}

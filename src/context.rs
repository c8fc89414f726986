//! Explicit construction context.
//!
//! There are no process-wide singletons: configuration, metrics and
//! the engine registry are built once after config loading and passed
//! by reference into every entry point. The context lives from init
//! until engine unload.

use std::path::Path;
use std::sync::Arc;

use crate::config::LogConfig;
use crate::engine::EngineRegistry;
use crate::log::{BinaryLog, LogResult};
use crate::observability::LogMetrics;
use crate::tclog::{MmapTcLog, TcLogError};

/// Everything the log core needs, constructed once in `main`.
pub struct LogContext {
    config: Arc<LogConfig>,
    metrics: Arc<LogMetrics>,
    engines: Arc<EngineRegistry>,
}

impl LogContext {
    pub fn new(config: LogConfig, engines: EngineRegistry) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(LogMetrics::new()),
            engines: Arc::new(engines),
        }
    }

    pub fn config(&self) -> &Arc<LogConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<LogMetrics> {
        &self.metrics
    }

    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    /// Open the replication log (and run crash recovery) under `dir`
    /// with the given base name.
    pub fn open_binlog(&self, dir: &Path, base_name: &str) -> LogResult<Arc<BinaryLog>> {
        BinaryLog::open(
            dir,
            base_name,
            self.config.clone(),
            self.metrics.clone(),
            &self.engines,
        )
        .map(Arc::new)
    }

    /// Open the memory-mapped XID log for deployments that run without
    /// the replication log.
    pub fn open_mmap_tclog(&self, path: &Path, size: u64) -> Result<Arc<MmapTcLog>, TcLogError> {
        MmapTcLog::open(path, size, &self.engines, self.metrics.clone()).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_context_opens_binlog() {
        let dir = TempDir::new().unwrap();
        let context = LogContext::new(LogConfig::new(1), EngineRegistry::new());
        let log = context.open_binlog(dir.path(), "log").unwrap();
        assert!(log.is_open());
    }

    #[test]
    fn test_context_shares_config() {
        let context = LogContext::new(LogConfig::new(5), EngineRegistry::new());
        context.config().set_sync_period(7);
        assert_eq!(context.config().sync_period(), 7);
        assert_eq!(context.config().server_id(), 5);
    }
}

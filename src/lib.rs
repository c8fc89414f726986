//! replog - transactional replication log and two-phase-commit
//! coordinator for a relational database server.
//!
//! Sessions stage statement and transaction events in spillable
//! per-session caches; at commit boundaries the cache is flushed under
//! strict ordering into an append-only, rotated, crash-recoverable
//! event log that both feeds replicas and arbitrates distributed
//! commit across pluggable storage engines. A memory-mapped fixed-slot
//! XID log stands in as the commit arbiter when the full log is
//! disabled.

pub mod cache;
pub mod config;
mod context;
pub mod engine;
pub mod event;
pub mod group_commit;
pub mod log;
pub mod observability;
pub mod recovery;
pub mod session;
pub mod tclog;

pub use config::LogConfig;
pub use context::LogContext;
pub use engine::{EngineRegistry, TransactionalEngine, Xid, XidSet};
pub use log::{BinaryLog, LogError, LogResult};
pub use observability::{LogMetrics, Logger};
pub use session::Session;
pub use tclog::{Cookie, MmapTcLog, TcLog};

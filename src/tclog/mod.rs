//! Two-phase-commit log backends.
//!
//! The engine coordinator talks to one `TcLog`. Normally that is the
//! replication log itself ([`crate::log::BinaryLog`]); when the full
//! log is disabled, the memory-mapped fixed-slot backend
//! ([`MmapTcLog`]) stands in with the same contract: `log_xid` makes
//! the transaction durable and returns a cookie, `unlog` acknowledges
//! the engine-side commit.

pub mod mmap;

pub use mmap::{MmapRecovery, MmapTcLog};

use std::io;

use thiserror::Error;

use crate::engine::{EngineError, TransactionalEngine, Xid};
use crate::log::LogResult;
use crate::session::Session;

/// Opaque value handed back from `log_xid` and returned in `unlog`.
/// The replication log uses the log position after the transaction;
/// the mmap backend uses the byte offset of the XID slot.
pub type Cookie = u64;

/// Durable arbiter for distributed commit.
pub trait TcLog: Send + Sync {
    /// Record that `xid` is committed as far as the coordinator is
    /// concerned. Returns a cookie to pass back to `unlog`.
    fn log_xid(
        &self,
        session: &Session,
        xid: Xid,
        engine: Option<&dyn TransactionalEngine>,
    ) -> LogResult<Cookie>;

    /// Acknowledge that every engine finished committing `xid`.
    fn unlog(&self, session: &Session, cookie: Cookie, xid: Xid) -> LogResult<()>;

    fn close(&self) -> LogResult<()>;
}

/// Errors opening or recovering an XID log backend.
#[derive(Debug, Error)]
pub enum TcLogError {
    #[error("xid log {file}: bad magic")]
    BadMagic { file: String },

    #[error(
        "xid log {file} was written with {expected} two-phase engines but {found} are \
         registered; recovery refused"
    )]
    EngineCountMismatch {
        file: String,
        expected: u8,
        found: u8,
    },

    #[error("xid log {file}: size {size} is not a positive multiple of the page size")]
    InvalidSize { file: String, size: u64 },

    #[error("xid log engine resolution failed: {0}; manual intervention required")]
    Engine(#[from] EngineError),

    #[error("xid log I/O error: {0}")]
    Io(#[from] io::Error),
}

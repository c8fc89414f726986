//! Log error vocabulary.
//!
//! I/O failures become typed errors here plus sticky flags on the log
//! object; the 2PC surface reports only success or failure to the
//! engine coordinator.

use std::io;

use thiserror::Error;

use crate::cache::CacheError;

pub type LogResult<T> = Result<T, LogError>;

/// How a log error leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation fails, the server continues.
    Error,
    /// Logging is disabled or startup is aborted; operator attention
    /// required.
    Fatal,
}

#[derive(Debug, Error)]
pub enum LogError {
    /// Append to the log file failed. Sets the sticky write-error flag.
    #[error("error writing to the log file {file}: {source}")]
    WriteFailed {
        file: String,
        #[source]
        source: io::Error,
    },

    /// Fsync of the log file failed. Sets the sticky sync-error flag
    /// and blocks further appends.
    #[error("error syncing the log file {file}: {source}")]
    SyncFailed {
        file: String,
        #[source]
        source: io::Error,
    },

    /// Switching to a new log file failed; logging is disabled for the
    /// rest of the process lifetime.
    #[error("log rotation failed: {reason}")]
    RotationFailed { reason: String },

    /// The log is closed or logging has been disabled.
    #[error("the log is closed")]
    Closed,

    /// A prior write or sync error short-circuits this operation.
    #[error("the log has a sticky write error; operation refused")]
    StickyWriteError,

    /// The session was killed; the statement is aborted.
    #[error("session killed")]
    Killed,

    /// The session cache rejected or lost a write.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The index file and the purge-pending file disagree and replay
    /// could not reconcile them.
    #[error("log index inconsistency: {reason}")]
    IndexInconsistency { reason: String },

    /// A purge target was named that the index does not know.
    #[error("cannot purge {file}: not listed in the log index")]
    UnknownLogFile { file: String },

    /// Stat or unlink of a purge victim failed with something other
    /// than file-not-found.
    #[error("purge failed on {file}: {source}")]
    PurgeFailed {
        file: String,
        #[source]
        source: io::Error,
    },

    /// Startup recovery could not complete; manual intervention
    /// required.
    #[error(transparent)]
    Recovery(#[from] crate::recovery::RecoveryError),

    /// Plain I/O outside the append path (index maintenance, close).
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LogError {
    pub fn severity(&self) -> Severity {
        match self {
            LogError::WriteFailed { .. } => Severity::Error,
            LogError::SyncFailed { .. } => Severity::Fatal,
            LogError::RotationFailed { .. } => Severity::Fatal,
            LogError::Closed => Severity::Error,
            LogError::StickyWriteError => Severity::Error,
            LogError::Killed => Severity::Error,
            LogError::Cache(_) => Severity::Error,
            LogError::IndexInconsistency { .. } => Severity::Fatal,
            LogError::UnknownLogFile { .. } => Severity::Error,
            LogError::PurgeFailed { .. } => Severity::Error,
            LogError::Recovery(_) => Severity::Fatal,
            LogError::Io(_) => Severity::Error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub fn is_cache_full(&self) -> bool {
        matches!(self, LogError::Cache(e) if e.is_cache_full())
    }
}

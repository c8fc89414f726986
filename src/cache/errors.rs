//! Session cache errors.

use std::io;

use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The write would push the cache past its hard cap. The statement
    /// fails; no log damage.
    #[error("transaction cache full: {requested} more bytes would exceed the {limit}-byte cap")]
    CacheFull { requested: u64, limit: u64 },

    /// The spill file failed underneath the cache.
    #[error("transaction cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    pub fn is_cache_full(&self) -> bool {
        matches!(self, CacheError::CacheFull { .. })
    }
}

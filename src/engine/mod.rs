//! Storage-engine coordinator boundary.
//!
//! Engines are plugins registered at startup. The log core never sees
//! engine internals; it calls through the `TransactionalEngine`
//! capability trait to prepare, commit, roll back and recover
//! transactions, and to ask whether the engine wants ticket-ordered
//! commit.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::session::Session;

/// Transaction identifier shared between the log and storage engines
/// for two-phase commit.
pub type Xid = u64;

/// The set of prepared-but-unresolved transactions handed to engines
/// during recovery.
pub type XidSet = HashSet<Xid>;

/// Result type for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by a storage engine to the coordinator.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine {0}: prepare failed: {1}")]
    PrepareFailed(String, String),

    #[error("engine {0}: commit failed: {1}")]
    CommitFailed(String, String),

    #[error("engine {0}: rollback failed: {1}")]
    RollbackFailed(String, String),

    #[error("engine {0}: recovery failed: {1}")]
    RecoveryFailed(String, String),
}

/// What an engine did with the prepared set during recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineRecovery {
    /// Prepared transactions found in the set and committed.
    pub committed: u64,
    /// Prepared transactions absent from the set and rolled back.
    pub rolled_back: u64,
}

/// Capability record for one pluggable storage engine.
///
/// `commit_fast` is the engine-side commit step whose ordering must
/// match log write order when the engine reports
/// `is_ordered_commit() == true`.
pub trait TransactionalEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this engine participates in two-phase commit.
    fn is_two_phase(&self) -> bool {
        true
    }

    fn prepare(&self, session: &Session, all: bool) -> EngineResult<()>;

    fn commit(&self, session: &Session, all: bool) -> EngineResult<()>;

    fn rollback(&self, session: &Session, all: bool) -> EngineResult<()>;

    /// The ordered post-commit step. Called with the session's ticket
    /// turn held when group commit is active.
    fn commit_fast(&self, session: &Session) -> EngineResult<()>;

    /// Whether commits through this engine must run in log order.
    fn is_ordered_commit(&self, session: &Session) -> bool;

    /// Finalize transactions present in `prepared`, discard those
    /// absent. Called once per engine at startup recovery.
    fn recover(&self, prepared: &XidSet) -> EngineResult<EngineRecovery>;
}

/// Registry of engines, populated once at startup.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn TransactionalEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn TransactionalEngine>) {
        self.engines.push(engine);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransactionalEngine>> {
        self.engines.iter()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Number of registered engines capable of two-phase commit. The
    /// memory-mapped XID log stamps this into its header and refuses to
    /// recover when it changes.
    pub fn two_phase_count(&self) -> usize {
        self.engines.iter().filter(|e| e.is_two_phase()).count()
    }

    /// Drive every two-phase engine's resolution of the prepared set.
    pub fn recover_all(&self, prepared: &XidSet) -> EngineResult<EngineRecovery> {
        let mut total = EngineRecovery::default();
        for engine in self.engines.iter().filter(|e| e.is_two_phase()) {
            let outcome = engine.recover(prepared)?;
            total.committed += outcome.committed;
            total.rolled_back += outcome.rolled_back;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.engines.iter().map(|e| e.name()).collect();
        f.debug_struct("EngineRegistry").field("engines", &names).finish()
    }
}

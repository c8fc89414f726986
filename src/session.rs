//! Per-connection session state.
//!
//! A session is owned by exactly one server thread. Components attach
//! their per-session state through an opaque handle map keyed by a
//! component identifier; the log core allocates its transaction cache
//! there on first use and releases it at session close.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a server component that stores per-session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(pub u32);

/// Handle slot for the replication log component.
pub const LOG_COMPONENT: ComponentId = ComponentId(1);

/// Per-connection session.
pub struct Session {
    id: u64,
    /// Set asynchronously when the connection is killed; checked at
    /// entry to and between major steps of log operations.
    killed: AtomicBool,
    /// True between an explicit transaction begin and its end.
    in_transaction: AtomicBool,
    /// Group-commit ordering ticket. 0 means "not ordered".
    ticket: AtomicU64,
    handles: Mutex<HashMap<ComponentId, Arc<dyn Any + Send + Sync>>>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            killed: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
            ticket: AtomicU64::new(0),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Mark the session as inside an explicit multi-statement
    /// transaction.
    pub fn begin_transaction(&self) {
        self.in_transaction.store(true, Ordering::SeqCst);
    }

    pub fn end_transaction(&self) {
        self.in_transaction.store(false, Ordering::SeqCst);
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// The session's group-commit ordering ticket; 0 means unordered.
    pub fn ticket(&self) -> u64 {
        self.ticket.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ticket(&self, ticket: u64) {
        self.ticket.store(ticket, Ordering::SeqCst);
    }

    /// Fetch a component's per-session handle, creating it on first use.
    pub fn handle_or_insert_with<F>(&self, id: ComponentId, create: F) -> Arc<dyn Any + Send + Sync>
    where
        F: FnOnce() -> Arc<dyn Any + Send + Sync>,
    {
        let mut handles = self.handles.lock().unwrap();
        handles.entry(id).or_insert_with(create).clone()
    }

    pub fn handle(&self, id: ComponentId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.handles.lock().unwrap().get(&id).cloned()
    }

    /// Remove and return a component's handle, normally at session end.
    pub fn release_handle(&self, id: ComponentId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.handles.lock().unwrap().remove(&id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("killed", &self.is_killed())
            .field("in_transaction", &self.in_transaction())
            .field("ticket", &self.ticket())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_state() {
        let session = Session::new(42);
        assert_eq!(session.id(), 42);
        assert!(!session.is_killed());
        assert!(!session.in_transaction());
        assert_eq!(session.ticket(), 0);
    }

    #[test]
    fn test_kill_flag() {
        let session = Session::new(1);
        session.kill();
        assert!(session.is_killed());
    }

    #[test]
    fn test_handle_created_once() {
        let session = Session::new(1);
        let first = session.handle_or_insert_with(LOG_COMPONENT, || Arc::new(7u32));
        let second = session.handle_or_insert_with(LOG_COMPONENT, || Arc::new(9u32));

        let first = first.downcast::<u32>().unwrap();
        let second = second.downcast::<u32>().unwrap();
        assert_eq!(*first, 7);
        assert_eq!(*second, 7);
    }

    #[test]
    fn test_release_handle() {
        let session = Session::new(1);
        session.handle_or_insert_with(LOG_COMPONENT, || Arc::new(1u8));
        assert!(session.release_handle(LOG_COMPONENT).is_some());
        assert!(session.handle(LOG_COMPONENT).is_none());
    }
}

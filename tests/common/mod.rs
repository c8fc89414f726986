//! Shared fixtures for the log integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use replog::engine::{EngineRecovery, EngineResult};
use replog::event::payload::Query;
use replog::event::reader::{EventReader, RawEvent};
use replog::event::EventType;
use replog::{
    BinaryLog, EngineRegistry, LogConfig, LogMetrics, Session, TransactionalEngine, Xid, XidSet,
};

/// Engine double that records the order of `commit_fast` calls and
/// whatever recovery hands it.
pub struct RecordingEngine {
    name: String,
    ordered: bool,
    pub commit_fast_order: Mutex<Vec<u64>>,
    pub recovered: Mutex<Vec<Xid>>,
    pub recover_calls: AtomicU64,
}

impl RecordingEngine {
    pub fn new(name: &str, ordered: bool) -> Self {
        Self {
            name: name.to_string(),
            ordered,
            commit_fast_order: Mutex::new(Vec::new()),
            recovered: Mutex::new(Vec::new()),
            recover_calls: AtomicU64::new(0),
        }
    }
}

impl TransactionalEngine for RecordingEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, _session: &Session, _all: bool) -> EngineResult<()> {
        Ok(())
    }

    fn commit(&self, _session: &Session, _all: bool) -> EngineResult<()> {
        Ok(())
    }

    fn rollback(&self, _session: &Session, _all: bool) -> EngineResult<()> {
        Ok(())
    }

    fn commit_fast(&self, session: &Session) -> EngineResult<()> {
        self.commit_fast_order.lock().unwrap().push(session.id());
        Ok(())
    }

    fn is_ordered_commit(&self, _session: &Session) -> bool {
        self.ordered
    }

    fn recover(&self, prepared: &XidSet) -> EngineResult<EngineRecovery> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        let mut xids: Vec<Xid> = prepared.iter().copied().collect();
        xids.sort_unstable();
        *self.recovered.lock().unwrap() = xids;
        Ok(EngineRecovery {
            committed: prepared.len() as u64,
            rolled_back: 0,
        })
    }
}

/// Open a log with one recording engine registered.
pub fn open_with_engine(
    dir: &Path,
    config: LogConfig,
    engine: Arc<RecordingEngine>,
) -> BinaryLog {
    let mut engines = EngineRegistry::new();
    engines.register(engine);
    BinaryLog::open(
        dir,
        "log",
        Arc::new(config),
        Arc::new(LogMetrics::new()),
        &engines,
    )
    .unwrap()
}

/// Open a log with no engines.
pub fn open_plain(dir: &Path, config: LogConfig) -> BinaryLog {
    BinaryLog::open(
        dir,
        "log",
        Arc::new(config),
        Arc::new(LogMetrics::new()),
        &EngineRegistry::new(),
    )
    .unwrap()
}

/// Every event of a log file, in order.
pub fn read_events(path: &Path) -> Vec<RawEvent> {
    let mut reader = EventReader::open(path).unwrap();
    let mut events = Vec::new();
    while let Some(event) = reader.next_event().unwrap() {
        events.push(event);
    }
    events
}

/// Event types of a log file, in order.
pub fn event_types(path: &Path) -> Vec<EventType> {
    read_events(path)
        .iter()
        .map(|e| e.header.event_type)
        .collect()
}

/// The SQL text of a query event.
pub fn query_text(event: &RawEvent) -> String {
    assert_eq!(event.header.event_type, EventType::Query);
    Query::decode(&event.payload).unwrap().query
}

/// Stage one INSERT-like statement in the session cache.
pub fn stage_insert(log: &BinaryLog, session: &Session, sql: &str) {
    log.begin_stmt(session);
    log.write_event(
        session,
        &replog::event::Event::query(log.config().server_id(), session.id() as u32, "", sql),
    )
    .unwrap();
}

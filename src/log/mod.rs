//! The binary log: append-only replication log, rotation, purge, and
//! the two-phase-commit surface exposed to the engine coordinator.
//!
//! One process-wide [`BinaryLog`] owns the active log file, the index
//! of files, the prepared-XID gate and the group-commit machinery.
//! Sessions stage events in their transaction caches; at a commit,
//! rollback-with-non-transactional-work or XID boundary the cache is
//! copied under the log lock as one contiguous group wrapped in
//! `BEGIN ... COMMIT/ROLLBACK/XID`.
//!
//! Lock order (outer to inner): log -> index -> group-commit ->
//! prepared-XIDs. The error-log sink is a leaf and safe under any of
//! them.

pub mod errors;
pub mod index;
pub mod purge;
pub mod writer;

pub use errors::{LogError, LogResult, Severity};
pub use index::LogIndex;
pub use purge::{PurgeOutcome, ReaderRegistry};
pub use writer::{is_in_use, LogWriter};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::cache::{TransactionCache, UNDEF_POS};
use crate::config::LogConfig;
use crate::engine::{EngineRegistry, TransactionalEngine, Xid};
use crate::event::{Event, EventType};
use crate::group_commit::{FsyncBatcher, SyncTarget, Ticketer};
use crate::observability::{LogMetrics, Logger};
use crate::recovery::{recover_at_startup, RecoveryReport};
use crate::session::{Session, LOG_COMPONENT};
use crate::tclog::{Cookie, TcLog};

/// Server version string stamped into format description events.
pub(crate) const SERVER_VERSION: &str = concat!("replog-", env!("CARGO_PKG_VERSION"));

const INCIDENT_MESSAGE: &str = "error writing to the log";

/// Everything guarded by the log lock.
struct LogState {
    writer: Option<LogWriter>,
    /// Sticky: an append failed; later operations short-circuit.
    write_error: bool,
    /// Sticky: an fsync failed; appends are refused until operator
    /// intervention.
    sync_error: bool,
    /// Rotation failed; logging is off for the rest of the process.
    disabled: bool,
    /// A rotation is in progress; new XID groups must hold off so the
    /// prepared count can drain.
    stop_new_xids: bool,
    /// Numeric suffix for the next log file.
    file_seq: u64,
    // Fsync batching state, under the log lock like the file itself.
    sync_counter: u64,
    waiting: u64,
    fsync_count: u64,
}

impl LogState {
    fn check_usable(&self) -> LogResult<()> {
        if self.disabled || self.writer.is_none() {
            return Err(LogError::Closed);
        }
        if self.write_error || self.sync_error {
            return Err(LogError::StickyWriteError);
        }
        Ok(())
    }

    fn file_name(&self) -> String {
        self.writer
            .as_ref()
            .map(|w| w.file_name())
            .unwrap_or_default()
    }
}

impl SyncTarget for LogState {
    fn sync_counter(&mut self) -> &mut u64 {
        &mut self.sync_counter
    }

    fn waiting(&mut self) -> &mut u64 {
        &mut self.waiting
    }

    fn fsync_count(&mut self) -> &mut u64 {
        &mut self.fsync_count
    }

    fn fsync(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.sync_io(),
            None => Ok(()),
        }
    }
}

/// The process-wide replication log and 2PC coordinator.
pub struct BinaryLog {
    dir: PathBuf,
    base_name: String,
    config: Arc<LogConfig>,
    metrics: Arc<LogMetrics>,
    log: Mutex<LogState>,
    /// Signaled whenever new bytes land in the active file or the log
    /// rotates; readers waiting for data park here.
    update_cond: Condvar,
    /// Paired with the log lock; wakes writers blocked on a rotation.
    stop_xids_cond: Condvar,
    batcher: FsyncBatcher,
    ticketer: Ticketer,
    /// XIDs durable in the log but not yet acknowledged by the engine.
    prep: Mutex<u64>,
    prep_cond: Condvar,
    index: Mutex<LogIndex>,
    readers: ReaderRegistry,
    /// Sessions currently inside the commit path; feeds the batching
    /// policy.
    commits_in_flight: AtomicU64,
    log_space_used: AtomicU64,
    recovery: Option<RecoveryReport>,
}

impl BinaryLog {
    /// Open the log at startup: replay any pending index mutation, run
    /// crash recovery against the engines, then start a fresh active
    /// file.
    pub fn open(
        dir: &Path,
        base_name: &str,
        config: Arc<LogConfig>,
        metrics: Arc<LogMetrics>,
        engines: &EngineRegistry,
    ) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        let index = LogIndex::open(&dir.join(base_name))?;

        let recovery = recover_at_startup(&index, engines)?;

        let entries = index.entries()?;
        let file_seq = next_file_seq(&entries);

        let name = format!("{}.{:06}", base_name, file_seq);
        let path = dir.join(&name);
        let path_str = path.to_string_lossy().into_owned();

        let server_id = config.server_id();
        let mut created: Option<LogWriter> = None;
        index.append_with(&path_str, || {
            created = Some(LogWriter::create(&path, server_id, SERVER_VERSION)?);
            Ok(())
        })?;
        let writer = created.ok_or_else(|| LogError::RotationFailed {
            reason: format!("could not create the initial log file {}", path_str),
        })?;

        let log_space: u64 = index
            .entries()?
            .iter()
            .filter_map(|e| fs::metadata(e).ok())
            .map(|m| m.len())
            .sum();

        Ok(Self {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            config,
            metrics,
            log: Mutex::new(LogState {
                writer: Some(writer),
                write_error: false,
                sync_error: false,
                disabled: false,
                stop_new_xids: false,
                file_seq: file_seq + 1,
                sync_counter: 0,
                waiting: 0,
                fsync_count: 0,
            }),
            update_cond: Condvar::new(),
            stop_xids_cond: Condvar::new(),
            batcher: FsyncBatcher::new(),
            ticketer: Ticketer::new(),
            prep: Mutex::new(0),
            prep_cond: Condvar::new(),
            index: Mutex::new(index),
            readers: ReaderRegistry::new(),
            commits_in_flight: AtomicU64::new(0),
            log_space_used: AtomicU64::new(log_space),
            recovery,
        })
    }

    /// What startup recovery found, if a previous log existed.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn metrics(&self) -> &LogMetrics {
        &self.metrics
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    pub fn is_open(&self) -> bool {
        let state = self.log.lock().unwrap();
        !state.disabled && state.writer.is_some()
    }

    /// Full path of the active log file.
    pub fn active_log(&self) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .writer
            .as_ref()
            .map(|w| w.path().to_string_lossy().into_owned())
    }

    pub fn index_entries(&self) -> LogResult<Vec<String>> {
        self.index.lock().unwrap().entries()
    }

    pub fn prepared_xids(&self) -> u64 {
        *self.prep.lock().unwrap()
    }

    pub fn log_space_used(&self) -> u64 {
        self.log_space_used.load(Ordering::Relaxed)
    }

    pub fn group_commit_active(&self) -> bool {
        self.ticketer.is_enabled()
    }

    /// Fault injection for ticket rollover tests.
    pub fn set_ticket_window(&self, current: u64, next: u64) {
        self.ticketer.set_ticket_window(current, next);
    }

    // ------------------------------------------------------------------
    // Session-facing event emission
    // ------------------------------------------------------------------

    /// The session's transaction cache, created on first use.
    pub fn session_cache(&self, session: &Session) -> Arc<Mutex<TransactionCache>> {
        let mem_limit = self.config.cache_size() as usize;
        let max_size = self.config.max_cache_size();
        let handle = session.handle_or_insert_with(LOG_COMPONENT, || {
            Arc::new(Mutex::new(TransactionCache::new(mem_limit, max_size)))
        });
        handle
            .downcast::<Mutex<TransactionCache>>()
            .expect("log component handle is always a transaction cache")
    }

    /// Release the session's cache at connection end. The cache must be
    /// empty: the server finishes or rolls back the transaction first.
    pub fn close_session(&self, session: &Session) {
        if let Some(handle) = session.release_handle(LOG_COMPONENT) {
            if let Ok(cache) = handle.downcast::<Mutex<TransactionCache>>() {
                debug_assert!(cache.lock().unwrap().is_empty());
            }
        }
    }

    /// Record the statement boundary in the session cache.
    pub fn begin_stmt(&self, session: &Session) {
        let handle = self.session_cache(session);
        handle.lock().unwrap().begin_stmt();
    }

    /// Note that the current statement wrote non-transactional state.
    pub fn note_non_trans_update(&self, session: &Session) {
        let handle = self.session_cache(session);
        handle.lock().unwrap().note_non_trans_update();
    }

    /// Stage a transactional event in the session cache.
    pub fn write_event(&self, session: &Session, event: &Event) -> LogResult<()> {
        if session.is_killed() {
            return Err(LogError::Killed);
        }
        let handle = self.session_cache(session);
        let mut cache = handle.lock().unwrap();
        cache.append_event(event)?;
        Ok(())
    }

    /// Stage a statement event, routing non-transactional work
    /// straight to the log when `direct_non_trans_update` is on.
    pub fn write_stmt_event(
        &self,
        session: &Session,
        event: &Event,
        transactional: bool,
    ) -> LogResult<()> {
        if !transactional && self.config.direct_non_trans_update() {
            return self.write_direct(session, event).map(|_| ());
        }
        if !transactional {
            self.note_non_trans_update(session);
        }
        self.write_event(session, event)
    }

    /// Write one event straight to the log, bypassing the cache. Used
    /// for non-transactional updates when `direct_non_trans_update` is
    /// on.
    pub fn write_direct(&self, session: &Session, event: &Event) -> LogResult<u64> {
        if session.is_killed() {
            return Err(LogError::Killed);
        }

        let mut guard = self.log.lock().unwrap();
        guard.check_usable()?;

        let start_pos;
        let end_pos;
        {
            let writer = guard.writer.as_mut().ok_or(LogError::Closed)?;
            start_pos = writer.pos();
            end_pos = match writer.append_event(event) {
                Ok(pos) => pos,
                Err(e) => {
                    self.note_write_error(&mut guard, &e);
                    return Err(e);
                }
            };
        }
        self.account_bytes(end_pos - start_pos);

        let pending = self.commits_in_flight.load(Ordering::Relaxed);
        let (g, sync_result) =
            self.batcher
                .flush_and_sync(guard, false, pending, &self.config, &self.metrics);
        guard = g;
        if let Err(e) = sync_result {
            return Err(self.note_sync_error(&mut guard, e));
        }

        self.update_cond.notify_all();

        let (guard, rotated, rotate_result) = self.maybe_rotate(guard);
        drop(guard);
        rotate_result?;
        if rotated {
            self.purge_expired();
        }

        Ok(end_pos)
    }

    /// Write an incident event so replicas halt instead of silently
    /// diverging. Runs even when the sticky write-error flag is set;
    /// that flag is exactly why an incident gets written.
    pub fn write_incident(&self, session: &Session) -> LogResult<u64> {
        let _ = session;
        let mut guard = self.log.lock().unwrap();
        if guard.disabled {
            return Err(LogError::Closed);
        }

        let start_pos;
        let end_pos;
        {
            let writer = guard.writer.as_mut().ok_or(LogError::Closed)?;
            start_pos = writer.pos();
            end_pos = writer.append_event(&Event::incident(
                self.config.server_id(),
                INCIDENT_MESSAGE,
            ))?;
        }
        self.account_bytes(end_pos - start_pos);
        self.metrics.increment_incidents();

        let pending = self.commits_in_flight.load(Ordering::Relaxed);
        let (guard, sync_result) =
            self.batcher
                .flush_and_sync(guard, false, pending, &self.config, &self.metrics);
        let mut guard = guard;
        if let Err(e) = sync_result {
            return Err(self.note_sync_error(&mut guard, e));
        }
        self.update_cond.notify_all();
        drop(guard);

        Ok(end_pos)
    }

    // ------------------------------------------------------------------
    // 2PC hooks
    // ------------------------------------------------------------------

    /// Nothing to do at prepare time: stating two-phase capability is
    /// the whole point. The real work happens in `log_xid`.
    pub fn prepare(&self, _session: &Session, _all: bool) -> LogResult<()> {
        Ok(())
    }

    /// Flush the transaction cache at a commit boundary, or keep
    /// collecting when a statement commits inside an open transaction.
    pub fn commit(&self, session: &Session, all: bool) -> LogResult<()> {
        self.commits_in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.commit_inner(session, all);
        self.commits_in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn commit_inner(&self, session: &Session, all: bool) -> LogResult<()> {
        let handle = self.session_cache(session);
        let mut cache = handle.lock().unwrap();

        if cache.is_empty() {
            // The cache was already flushed by log_xid.
            cache.reset();
            return Ok(());
        }

        let ending = all || !session.in_transaction();
        // Flush when the transaction ends, or when nothing has been
        // committed yet and the statement only touched
        // non-transactional state.
        let flush = ending
            || (!cache.at_least_one_stmt_committed()
                && !cache.stmt_wrote_to_cache()
                && cache.stmt_modified_non_trans());

        let mut result = Ok(());
        if flush {
            let commit_ev =
                Event::query(self.config.server_id(), session.id() as u32, "", "COMMIT");
            result = self
                .end_trans(session, &mut cache, Some(commit_ev), all, None)
                .map(|_| ());
        }

        cache.mark_stmt_committed();
        if !all {
            cache.clear_before_stmt_pos();
        }
        result
    }

    /// Undo a statement or transaction. Work on non-transactional
    /// state cannot be undone, so those rollbacks still reach the log
    /// wrapped in `BEGIN ... ROLLBACK`; a prior write error additionally
    /// produces an incident event so replicas halt.
    pub fn rollback(&self, session: &Session, all: bool) -> LogResult<()> {
        let handle = self.session_cache(session);
        let mut cache = handle.lock().unwrap();

        if cache.is_empty() {
            cache.reset();
            return Ok(());
        }

        let ending = all || !session.in_transaction();
        let keep_log = self.config.keep_log();

        let result = if self.has_write_error() {
            // The statement never made it into the log. If it touched
            // non-transactional state (or keep_log is set) replicas
            // must be told that changes were lost.
            if cache.stmt_modified_non_trans() || keep_log {
                cache.set_incident();
            }
            self.end_trans(session, &mut cache, None, all, None)
        } else if (ending && (cache.trans_modified_non_trans() || keep_log))
            || (!cache.at_least_one_stmt_committed() && cache.stmt_modified_non_trans())
        {
            let rollback_ev =
                Event::query(self.config.server_id(), session.id() as u32, "", "ROLLBACK");
            self.end_trans(session, &mut cache, Some(rollback_ev), all, None)
        } else if ending || (!keep_log && !cache.stmt_modified_non_trans()) {
            self.end_trans(session, &mut cache, None, all, None)
        } else {
            Ok(0)
        };

        if !all {
            cache.clear_before_stmt_pos();
        }
        result.map(|_| ())
    }

    /// Write the savepoint into the cache so replicas observe it, and
    /// return the offset to truncate back to: the savepoint event is
    /// dropped together with everything after it.
    pub fn savepoint_set(&self, session: &Session, name: &str) -> LogResult<u64> {
        let handle = self.session_cache(session);
        let mut cache = handle.lock().unwrap();

        let sql = format!("SAVEPOINT `{}`", name);
        let event = Event::query(self.config.server_id(), session.id() as u32, "", &sql);
        let token = cache.savepoint_set(&event)?;
        Ok(token)
    }

    /// Roll back to a savepoint token. With non-transactional changes
    /// in the transaction (or keep_log), the buffered work must reach
    /// replicas, so a `ROLLBACK TO` is appended instead of truncating.
    pub fn savepoint_rollback(
        &self,
        session: &Session,
        name: &str,
        token: u64,
    ) -> LogResult<()> {
        let handle = self.session_cache(session);
        let mut cache = handle.lock().unwrap();

        if cache.trans_modified_non_trans() || self.config.keep_log() {
            let sql = format!("ROLLBACK TO `{}`", name);
            let event = Event::query(self.config.server_id(), session.id() as u32, "", &sql);
            cache.append_event(&event)?;
        } else {
            cache.truncate(token);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ordered engine commit
    // ------------------------------------------------------------------

    /// Block until this session's ticket is current. No-op for
    /// unordered commits.
    pub fn wait_for_commit_order(&self, session: &Session) {
        self.ticketer
            .wait_for_turn(session, &self.config, &self.metrics);
    }

    /// Pass the turn to the next ticket after the engine-side commit.
    pub fn release_commit_order(&self, session: &Session) {
        self.ticketer.release_turn(session, &self.metrics);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn has_write_error(&self) -> bool {
        self.log.lock().unwrap().write_error
    }

    fn account_bytes(&self, bytes: u64) {
        self.metrics.add_bytes_written(bytes);
        self.log_space_used.fetch_add(bytes, Ordering::Relaxed);
    }

    fn note_write_error(&self, guard: &mut MutexGuard<'_, LogState>, err: &LogError) {
        if err.is_cache_full() {
            // Session-level failure; the log itself is undamaged.
            return;
        }
        if !guard.write_error {
            guard.write_error = true;
            Logger::error(
                "LOG_WRITE_FAILED",
                &[("file", &guard.file_name()), ("error", &err.to_string())],
            );
        }
    }

    fn note_sync_error(&self, guard: &mut MutexGuard<'_, LogState>, source: io::Error) -> LogError {
        guard.sync_error = true;
        let err = LogError::SyncFailed {
            file: guard.file_name(),
            source,
        };
        Logger::error("LOG_SYNC_FAILED", &[("error", &err.to_string())]);
        err
    }

    /// End a transaction against the log.
    ///
    /// With an end event, the cache is copied out as one group wrapped
    /// in BEGIN and the end event, then reset. Without one, this is a
    /// rollback with nothing to replicate: the cache is reset (whole
    /// transaction) or truncated to the statement boundary.
    fn end_trans(
        &self,
        session: &Session,
        cache: &mut TransactionCache,
        end_event: Option<Event>,
        all: bool,
        engine: Option<&dyn TransactionalEngine>,
    ) -> LogResult<u64> {
        match end_event {
            Some(end_ev) => {
                cache.flush_pending()?;
                let result = self.write_transaction(session, cache, &end_ev, engine);

                self.metrics.increment_cache_uses();
                if cache.take_disk_writes() > 0 {
                    self.metrics.increment_cache_spills();
                }
                cache.reset();
                result
            }
            None => {
                if all || !session.in_transaction() {
                    if cache.has_incident() {
                        self.write_incident(session)?;
                    }
                    cache.reset();
                } else {
                    let boundary = cache.before_stmt_pos();
                    let target = if boundary == UNDEF_POS { 0 } else { boundary };
                    cache.truncate(target);
                }
                Ok(0)
            }
        }
    }

    /// Copy the cache into the log under the log lock, then run the
    /// fsync batching step and, for XID groups, raise the prepared
    /// count that gates rotation.
    fn write_transaction(
        &self,
        session: &Session,
        cache: &mut TransactionCache,
        end_ev: &Event,
        engine: Option<&dyn TransactionalEngine>,
    ) -> LogResult<u64> {
        let is_xid = end_ev.header.event_type == EventType::Xid;

        let mut guard = self.log.lock().unwrap();
        if is_xid {
            // A rotation in progress must not see new prepared XIDs.
            while guard.stop_new_xids {
                guard = self.stop_xids_cond.wait(guard).unwrap();
            }
        }
        guard.check_usable()?;

        let end_pos = match self.append_group(&mut guard, session, cache, end_ev) {
            Ok(pos) => pos,
            Err(e) => {
                self.note_write_error(&mut guard, &e);
                return Err(e);
            }
        };

        // The ticket must be taken before the batched wait can release
        // the log lock, so ticket order equals log order.
        let ordered = self
            .ticketer
            .order(session, &self.config, &self.metrics, engine)
            != 0;

        let pending = self.commits_in_flight.load(Ordering::Relaxed);
        let (g, sync_result) =
            self.batcher
                .flush_and_sync(guard, ordered, pending, &self.config, &self.metrics);
        guard = g;
        if let Err(e) = sync_result {
            return Err(self.note_sync_error(&mut guard, e));
        }

        self.update_cond.notify_all();

        if is_xid {
            {
                let mut prep = self.prep.lock().unwrap();
                *prep += 1;
            }
            self.metrics.increment_prepared_logged();
            drop(guard);
        } else {
            let (guard, rotated, rotate_result) = self.maybe_rotate(guard);
            drop(guard);
            rotate_result?;
            if rotated {
                self.purge_expired();
            }
        }

        Ok(end_pos)
    }

    fn append_group(
        &self,
        guard: &mut MutexGuard<'_, LogState>,
        session: &Session,
        cache: &mut TransactionCache,
        end_ev: &Event,
    ) -> LogResult<u64> {
        let server_id = self.config.server_id();
        let writer = guard.writer.as_mut().ok_or(LogError::Closed)?;
        let start_pos = writer.pos();

        if cache.position() > 0 {
            let begin = Event::query(server_id, session.id() as u32, "", "BEGIN");
            writer.append_event(&begin)?;

            cache.start_read();
            writer.append_cache(cache)?;

            writer.append_event(end_ev)?;

            if cache.has_incident() {
                writer.append_event(&Event::incident(server_id, INCIDENT_MESSAGE))?;
                self.metrics.increment_incidents();
            }
        }

        let end_pos = writer.pos();
        self.account_bytes(end_pos - start_pos);
        Ok(end_pos)
    }

    /// Rotate if the active file has reached the size threshold. An
    /// in-progress rotation is waited out first; the threshold is
    /// checked against whatever file is active afterwards, so a
    /// just-rotated log is not rotated twice.
    fn maybe_rotate<'a>(
        &'a self,
        mut guard: MutexGuard<'a, LogState>,
    ) -> (MutexGuard<'a, LogState>, bool, LogResult<()>) {
        while guard.stop_new_xids {
            guard = self.stop_xids_cond.wait(guard).unwrap();
        }
        let over = guard
            .writer
            .as_ref()
            .map(|w| w.pos() >= self.config.max_log_size())
            .unwrap_or(false);
        if !over {
            return (guard, false, Ok(()));
        }
        let (guard, result) = self.rotate(guard);
        let rotated = result.is_ok();
        (guard, rotated, result)
    }

    /// Switch to a new log file. Blocks new XID groups, waits for the
    /// prepared count to drain so recovery never needs more than one
    /// file, then swaps files and records the new name in the index.
    fn rotate<'a>(
        &'a self,
        mut guard: MutexGuard<'a, LogState>,
    ) -> (MutexGuard<'a, LogState>, LogResult<()>) {
        if guard.writer.is_none() {
            return (guard, Ok(()));
        }

        // Another session may already be rotating.
        while guard.stop_new_xids {
            guard = self.stop_xids_cond.wait(guard).unwrap();
        }
        guard.stop_new_xids = true;

        if *self.prep.lock().unwrap() > 0 {
            // Drop the log lock while prepared XIDs drain: their
            // sessions may be parked in the fsync batcher and need the
            // lock to get out.
            self.metrics.increment_page_waits();
            drop(guard);
            {
                let mut prep = self.prep.lock().unwrap();
                while *prep > 0 {
                    prep = self.prep_cond.wait(prep).unwrap();
                }
            }
            guard = self.log.lock().unwrap();
        }

        let result = self.rotate_locked(&mut guard);
        guard.stop_new_xids = false;
        self.stop_xids_cond.notify_all();

        match result {
            Ok(()) => {
                self.metrics.increment_rotations();
                (guard, Ok(()))
            }
            Err(e) => {
                // Disabling logging is deliberate here: losing the log
                // beats taking the server down mid-commit.
                guard.disabled = true;
                if let Some(writer) = guard.writer.take() {
                    let _ = writer.close(false);
                }
                let err = LogError::RotationFailed {
                    reason: e.to_string(),
                };
                Logger::fatal("LOG_ROTATION_FAILED", &[("reason", &e.to_string())]);
                (guard, Err(err))
            }
        }
    }

    fn rotate_locked(&self, guard: &mut MutexGuard<'_, LogState>) -> LogResult<()> {
        let index = self.index.lock().unwrap();
        let server_id = self.config.server_id();

        let next_name = format!("{}.{:06}", self.base_name, guard.file_seq);
        let next_path = self.dir.join(&next_name);
        let next_path_str = next_path.to_string_lossy().into_owned();

        {
            let writer = guard.writer.as_mut().ok_or(LogError::Closed)?;
            let start = writer.pos();
            writer.append_event(&Event::rotate(server_id, &next_name))?;
            let end = writer.pos();
            self.account_bytes(end - start);
        }
        // Wake readers so they notice end-of-file and follow the
        // rotate event to the next file.
        self.update_cond.notify_all();

        let old = guard.writer.take().ok_or(LogError::Closed)?;
        old.close(false)?;

        let mut created: Option<LogWriter> = None;
        index.append_with(&next_path_str, || {
            created = Some(LogWriter::create(&next_path, server_id, SERVER_VERSION)?);
            Ok(())
        })?;
        let new_writer = created.ok_or_else(|| LogError::RotationFailed {
            reason: format!("could not create {}", next_path_str),
        })?;
        self.log_space_used
            .fetch_add(new_writer.pos(), Ordering::Relaxed);

        guard.writer = Some(new_writer);
        guard.file_seq += 1;

        Logger::info("LOG_ROTATED", &[("file", &next_path_str)]);
        Ok(())
    }

    /// Rotate if the size threshold demands it, then purge expired
    /// files. The public entry, used by `unlog` and by operators.
    pub fn rotate_and_purge(&self) -> LogResult<bool> {
        let guard = self.log.lock().unwrap();
        if guard.disabled {
            // Logging is gone for this process; acknowledgments must
            // still succeed.
            return Ok(false);
        }
        let (guard, rotated, result) = self.maybe_rotate(guard);
        drop(guard);
        result?;
        if rotated {
            self.purge_expired();
        }
        Ok(rotated)
    }

    // ------------------------------------------------------------------
    // Purge
    // ------------------------------------------------------------------

    /// Delete obsolete files from the head of the index up to `to_log`
    /// (a path as listed in the index).
    pub fn purge_logs(&self, to_log: &str, inclusive: bool) -> LogResult<PurgeOutcome> {
        let active = self.active_log().unwrap_or_default();
        let index = self.index.lock().unwrap();
        let outcome = purge::purge_logs(&index, &self.readers, &active, to_log, inclusive)?;
        drop(index);
        self.finish_purge(&outcome);
        Ok(outcome)
    }

    /// Delete obsolete files last modified before `cutoff`.
    pub fn purge_logs_before(&self, cutoff: SystemTime) -> LogResult<PurgeOutcome> {
        let active = self.active_log().unwrap_or_default();
        let index = self.index.lock().unwrap();
        let outcome = purge::purge_logs_before(&index, &self.readers, &active, cutoff)?;
        drop(index);
        self.finish_purge(&outcome);
        Ok(outcome)
    }

    fn finish_purge(&self, outcome: &PurgeOutcome) {
        if outcome.removed.is_empty() {
            return;
        }
        self.metrics.add_logs_purged(outcome.removed.len() as u64);
        let reclaimed = outcome.bytes_reclaimed;
        let _ = self
            .log_space_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(reclaimed))
            });
    }

    fn purge_expired(&self) {
        let days = self.config.expire_days();
        if days == 0 {
            return;
        }
        let cutoff = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        if let Err(e) = self.purge_logs_before(cutoff) {
            Logger::warn("PURGE_FAILED", &[("error", &e.to_string())]);
        }
    }

    // ------------------------------------------------------------------
    // Readers and shutdown
    // ------------------------------------------------------------------

    /// Park until the log grows or rotates, or the timeout passes.
    /// Returns false on timeout.
    pub fn wait_for_update(&self, timeout: Duration) -> bool {
        let guard = self.log.lock().unwrap();
        let (_guard, result) = self.update_cond.wait_timeout(guard, timeout).unwrap();
        !result.timed_out()
    }

    /// Clean shutdown: stop event, clear the in-use flag, close the
    /// file. The prepared count must have drained.
    pub fn close(&self) -> LogResult<()> {
        debug_assert_eq!(self.prepared_xids(), 0);
        let mut guard = self.log.lock().unwrap();
        if let Some(writer) = guard.writer.take() {
            writer.close(true)?;
        }
        Ok(())
    }
}

impl TcLog for BinaryLog {
    /// Append the XID event and commit the whole buffered transaction
    /// through the log. The cookie is the log position after the
    /// group; it is never zero.
    fn log_xid(
        &self,
        session: &Session,
        xid: Xid,
        engine: Option<&dyn TransactionalEngine>,
    ) -> LogResult<Cookie> {
        self.commits_in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.log_xid_inner(session, xid, engine);
        self.commits_in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Acknowledge the engine-side commit of a prepared transaction.
    /// When the count drains to zero a blocked rotation may proceed;
    /// afterwards the size threshold is checked.
    fn unlog(&self, _session: &Session, _cookie: Cookie, _xid: Xid) -> LogResult<()> {
        {
            let mut prep = self.prep.lock().unwrap();
            debug_assert!(*prep > 0);
            *prep = prep.saturating_sub(1);
            if *prep == 0 {
                self.prep_cond.notify_all();
            }
        }
        self.metrics.decrement_prepared_logged();
        self.rotate_and_purge().map(|_| ())
    }

    fn close(&self) -> LogResult<()> {
        BinaryLog::close(self)
    }
}

impl BinaryLog {
    fn log_xid_inner(
        &self,
        session: &Session,
        xid: Xid,
        engine: Option<&dyn TransactionalEngine>,
    ) -> LogResult<Cookie> {
        let handle = self.session_cache(session);
        let mut cache = handle.lock().unwrap();

        let xid_ev = Event::xid(self.config.server_id(), xid);
        self.end_trans(session, &mut cache, Some(xid_ev), true, engine)
    }
}

/// Next numeric suffix given the existing index entries.
fn next_file_seq(entries: &[String]) -> u64 {
    entries
        .iter()
        .filter_map(|e| e.rsplit('.').next())
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> BinaryLog {
        let config = Arc::new(LogConfig::new(3));
        let metrics = Arc::new(LogMetrics::new());
        let engines = EngineRegistry::new();
        BinaryLog::open(dir.path(), "log", config, metrics, &engines).unwrap()
    }

    #[test]
    fn test_open_creates_file_and_index_entry() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        let entries = log.index_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("log.000001"));
        assert_eq!(log.active_log().unwrap(), entries[0]);
        assert!(log.is_open());
        assert!(log.recovery_report().is_none());
    }

    #[test]
    fn test_commit_empty_cache_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let session = Session::new(1);

        log.commit(&session, true).unwrap();
        assert_eq!(log.metrics().cache_uses(), 0);
    }

    #[test]
    fn test_log_xid_raises_and_unlog_drains_prepared() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let session = Session::new(1);

        log.begin_stmt(&session);
        log.write_event(&session, &Event::query(3, 1, "", "INSERT INTO t VALUES (1)"))
            .unwrap();

        let cookie = log.log_xid(&session, 71, None).unwrap();
        assert!(cookie > 0);
        assert_eq!(log.prepared_xids(), 1);

        log.unlog(&session, cookie, 71).unwrap();
        assert_eq!(log.prepared_xids(), 0);
    }

    #[test]
    fn test_log_xid_with_empty_cache_still_succeeds() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let session = Session::new(1);

        let cookie = log.log_xid(&session, 5, None).unwrap();
        assert!(cookie > 0);
        assert_eq!(log.prepared_xids(), 1);
        log.unlog(&session, cookie, 5).unwrap();
    }

    #[test]
    fn test_close_clears_in_use() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let active = log.active_log().unwrap();

        assert!(is_in_use(Path::new(&active)).unwrap());
        BinaryLog::close(&log).unwrap();
        assert!(!is_in_use(Path::new(&active)).unwrap());
        assert!(!log.is_open());
    }

    #[test]
    fn test_next_file_seq() {
        assert_eq!(next_file_seq(&[]), 1);
        assert_eq!(
            next_file_seq(&["/data/log.000001".into(), "/data/log.000007".into()]),
            8
        );
    }

    #[test]
    fn test_session_cache_is_created_once() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let session = Session::new(9);

        let first = log.session_cache(&session);
        let second = log.session_cache(&session);
        assert!(Arc::ptr_eq(&first, &second));

        log.close_session(&session);
        assert!(session.handle(LOG_COMPONENT).is_none());
    }
}

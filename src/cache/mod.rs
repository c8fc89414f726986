//! Per-session transaction cache.
//!
//! A session's transaction events accumulate here until the boundary
//! decision at commit, rollback or XID time. Valid truncation targets
//! are exactly statement boundaries: every offset that reaches
//! `before_stmt_pos` was recorded at the start of a statement, and
//! savepoint tokens are taken before the savepoint event is written.

mod errors;
mod spill;

pub use errors::{CacheError, CacheResult};
pub use spill::SpillBuffer;

use crate::event::copy::SegmentSource;
use crate::event::{Event, EventType};

/// Sentinel meaning "no statement boundary recorded".
pub const UNDEF_POS: u64 = u64::MAX;

/// A rows event being accumulated row by row. It has not been
/// serialized into the cache yet; it is flushed (or discarded) before
/// any other event enters the buffer.
#[derive(Debug, Clone)]
pub struct PendingRowsEvent {
    event: Event,
    rows: usize,
}

impl PendingRowsEvent {
    pub fn new(server_id: u32, table_id: u64) -> Self {
        Self {
            event: Event::with_payload(EventType::Rows, server_id, table_id.to_le_bytes().to_vec()),
            rows: 0,
        }
    }

    pub fn add_row(&mut self, row: &[u8]) {
        self.event.payload.extend_from_slice(row);
        self.event.header.event_len += row.len() as u32;
        self.rows += 1;
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    fn into_event(self) -> Event {
        self.event
    }
}

/// Spillable buffer plus the transaction boundary state of one session.
pub struct TransactionCache {
    buf: SpillBuffer,
    /// Buffer offset captured at statement start; UNDEF_POS when no
    /// statement is open.
    before_stmt_pos: u64,
    /// True once a statement has been committed into the buffer.
    at_least_one_stmt_committed: bool,
    /// Set when a write failure means replicas must be told that
    /// changes were lost.
    incident: bool,
    pending: Option<PendingRowsEvent>,
    /// Any statement of the transaction touched non-transactional state.
    trans_modified_non_trans: bool,
    /// The current statement touched non-transactional state.
    stmt_modified_non_trans: bool,
}

impl TransactionCache {
    pub fn new(mem_limit: usize, max_size: u64) -> Self {
        Self {
            buf: SpillBuffer::with_limits(mem_limit, max_size),
            before_stmt_pos: UNDEF_POS,
            at_least_one_stmt_committed: false,
            incident: false,
            pending: None,
            trans_modified_non_trans: false,
            stmt_modified_non_trans: false,
        }
    }

    pub fn position(&self) -> u64 {
        self.buf.position()
    }

    /// Logically empty: nothing buffered and nothing pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_none() && self.buf.position() == 0
    }

    /// Record the statement boundary. Nested calls keep the earliest
    /// one; only the outermost statement start is a truncation target.
    pub fn begin_stmt(&mut self) {
        self.stmt_modified_non_trans = false;
        if self.before_stmt_pos == UNDEF_POS {
            self.before_stmt_pos = self.buf.position();
        }
    }

    pub fn before_stmt_pos(&self) -> u64 {
        self.before_stmt_pos
    }

    pub fn clear_before_stmt_pos(&mut self) {
        self.before_stmt_pos = UNDEF_POS;
    }

    /// Serialize an event into the buffer, flushing any pending rows
    /// event first. The event's end position is stamped relative to the
    /// start of the buffer; the copy to the log rebases it.
    pub fn append_event(&mut self, event: &Event) -> CacheResult<()> {
        self.flush_pending()?;
        self.write_event(event)
    }

    fn write_event(&mut self, event: &Event) -> CacheResult<()> {
        let bytes = event.to_bytes_at(self.buf.position());
        self.buf.write(&bytes).map_err(|e| {
            if e.is_cache_full() {
                self.incident = true;
            }
            e
        })
    }

    /// Stage a rows event; an already-pending one is serialized first.
    pub fn set_pending(&mut self, pending: PendingRowsEvent) -> CacheResult<()> {
        self.flush_pending()?;
        self.pending = Some(pending);
        Ok(())
    }

    pub fn pending_mut(&mut self) -> Option<&mut PendingRowsEvent> {
        self.pending.as_mut()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Serialize the pending rows event into the buffer, if any.
    pub fn flush_pending(&mut self) -> CacheResult<()> {
        if let Some(pending) = self.pending.take() {
            let event = pending.into_event();
            self.write_event(&event)?;
        }
        Ok(())
    }

    /// Write the savepoint event and return the token to roll back to:
    /// the offset just before the event, so truncating to the token
    /// also removes the savepoint itself.
    pub fn savepoint_set(&mut self, event: &Event) -> CacheResult<u64> {
        let token = self.buf.position();
        self.append_event(event)?;
        Ok(token)
    }

    /// Discard any pending rows event and everything past `pos`.
    pub fn truncate(&mut self, pos: u64) {
        self.pending = None;
        self.buf.truncate(pos);
        if pos < self.before_stmt_pos && self.before_stmt_pos != UNDEF_POS {
            self.before_stmt_pos = UNDEF_POS;
        }
        self.at_least_one_stmt_committed = pos > 0;
    }

    /// Empty the cache completely and clear all transaction state.
    pub fn reset(&mut self) {
        if !self.is_empty() {
            self.truncate(0);
        }
        self.before_stmt_pos = UNDEF_POS;
        self.at_least_one_stmt_committed = false;
        self.incident = false;
        self.trans_modified_non_trans = false;
        self.stmt_modified_non_trans = false;
        debug_assert!(self.is_empty());
    }

    pub fn set_incident(&mut self) {
        self.incident = true;
    }

    pub fn has_incident(&self) -> bool {
        self.incident
    }

    /// Note a write to non-transactional state in the current statement.
    pub fn note_non_trans_update(&mut self) {
        self.trans_modified_non_trans = true;
        self.stmt_modified_non_trans = true;
    }

    pub fn trans_modified_non_trans(&self) -> bool {
        self.trans_modified_non_trans
    }

    pub fn stmt_modified_non_trans(&self) -> bool {
        self.stmt_modified_non_trans
    }

    pub fn at_least_one_stmt_committed(&self) -> bool {
        self.at_least_one_stmt_committed
    }

    /// Recompute the committed flag after a statement-level commit.
    pub fn mark_stmt_committed(&mut self) {
        self.at_least_one_stmt_committed = self.buf.position() > 0;
    }

    /// Whether the current statement wrote transactional events into
    /// the buffer.
    pub fn stmt_wrote_to_cache(&self) -> bool {
        self.before_stmt_pos != UNDEF_POS && self.buf.position() > self.before_stmt_pos
    }

    pub fn spilled(&self) -> bool {
        self.buf.spilled()
    }

    pub fn take_disk_writes(&mut self) -> u64 {
        self.buf.take_disk_writes()
    }

    /// Position the read cursor for the copy to the log.
    pub fn start_read(&mut self) {
        self.buf.start_read();
    }
}

impl SegmentSource for TransactionCache {
    fn read_segment(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.buf.read_segment(buf)
    }
}

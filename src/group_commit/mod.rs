//! Group-commit coordinator.
//!
//! Two cooperating mechanisms:
//!
//! - **Ticketing** hands every ordered commit a monotonically
//!   increasing ticket and makes engine-side commits run in ticket
//!   order, which equals log write order. Waiters park on one of a
//!   small set of condvar buckets keyed by ticket number so a release
//!   wakes only the sessions that could be next.
//! - **Fsync batching** lets concurrent committers share one fsync:
//!   when enough commits are pending, a session parks briefly on a
//!   shared condvar instead of syncing; whoever wakes first with the
//!   fsync count unchanged performs the sync for everyone.
//!
//! Ticket waits are bounded. A wait past the configured disable
//! threshold, or a ticket counter about to roll over, disables group
//! commit for the rest of the process lifetime; in-flight transactions
//! complete on the unordered path. Disablement is never undone.

use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::LogConfig;
use crate::engine::TransactionalEngine;
use crate::observability::{LogMetrics, Logger, SLOW_FSYNC_MICROS};
use crate::session::Session;

/// Number of condvar buckets for ticket waiters; a small power of two.
pub const NUM_COMMIT_COND: usize = 8;

/// Ticket waits use one-second slices so a stuck waiter can account
/// for its wall-clock wait and trip the hang thresholds.
const TICKET_WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TicketState {
    /// The ticket allowed to act now.
    current: u64,
    /// The next ticket to hand out.
    next: u64,
    enabled: bool,
}

/// Orders engine-side commits to match log write order.
pub struct Ticketer {
    state: Mutex<TicketState>,
    buckets: [Condvar; NUM_COMMIT_COND],
}

impl Ticketer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TicketState {
                current: 1,
                next: 1,
                enabled: true,
            }),
            buckets: Default::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    /// Fault injection for rollover testing: force the counters to a
    /// chosen window.
    pub fn set_ticket_window(&self, current: u64, next: u64) {
        let mut state = self.state.lock().unwrap();
        state.current = current;
        state.next = next;
    }

    /// Take a ticket for this session if the commit should be ordered.
    /// Returns 0 when the session takes the unordered path.
    pub fn order(
        &self,
        session: &Session,
        config: &LogConfig,
        metrics: &LogMetrics,
        engine: Option<&dyn TransactionalEngine>,
    ) -> u64 {
        if !config.group_commit_enabled() {
            return 0;
        }

        let ordered_engine = match engine {
            Some(e) if e.is_ordered_commit(session) => e,
            _ => {
                metrics.increment_ordering_skipped();
                return 0;
            }
        };
        let _ = ordered_engine;

        if session.ticket() != 0 {
            let mut state = self.state.lock().unwrap();
            self.disable(&mut state, session, metrics, "ticket already set");
            return 0;
        }

        let mut state = self.state.lock().unwrap();
        if !state.enabled {
            return 0;
        }

        let ticket = state.next;
        state.next = state.next.wrapping_add(1);

        if ticket.wrapping_add(1) == 0 {
            self.disable(&mut state, session, metrics, "ticket rolled over");
            return 0;
        }

        session.set_ticket(ticket);
        ticket
    }

    /// Block until it is this session's turn, or until group commit is
    /// disabled. Bounded one-second waits; overruns log and eventually
    /// disable the feature rather than hanging commits.
    pub fn wait_for_turn(&self, session: &Session, config: &LogConfig, metrics: &LogMetrics) {
        let ticket = session.ticket();
        if ticket == 0 {
            return;
        }

        let start = Instant::now();
        let mut logged_hang = false;
        let mut counted_long = false;

        let mut state = self.state.lock().unwrap();
        let initial = state.current;

        while state.enabled && ticket > state.current {
            let slot = (ticket as usize) % NUM_COMMIT_COND;
            let (guard, timeout) = self.buckets[slot]
                .wait_timeout(state, TICKET_WAIT_SLICE)
                .unwrap();
            state = guard;

            if timeout.timed_out() {
                let waited = start.elapsed();

                if waited.as_secs() >= config.group_commit_hang_disable_sec() {
                    self.disable(&mut state, session, metrics, "waited too long for ticket");
                } else if !counted_long && waited.as_secs_f64() > 0.9 {
                    counted_long = true;
                    metrics.increment_ticket_long_waits();
                }

                if !logged_hang && waited.as_secs() >= config.group_commit_hang_log_sec() {
                    logged_hang = true;
                    Logger::error(
                        "GROUP_COMMIT_SLOW_TICKET",
                        &[
                            ("session", &session.id().to_string()),
                            ("ticket", &ticket.to_string()),
                            ("current", &state.current.to_string()),
                            ("initial", &initial.to_string()),
                            ("waited_micros", &(waited.as_micros() as u64).to_string()),
                        ],
                    );
                }
            }
        }
        drop(state);

        let waited = start.elapsed();
        metrics.record_ticket_wait(waited.as_micros() as u64);

        if waited.as_secs() >= config.group_commit_hang_log_sec() {
            Logger::error(
                "GROUP_COMMIT_SLOW_TICKET_DONE",
                &[
                    ("session", &session.id().to_string()),
                    ("ticket", &ticket.to_string()),
                    ("waited_micros", &(waited.as_micros() as u64).to_string()),
                ],
            );
        }
    }

    /// Pass the turn to the next ticket and wake its bucket. Clears the
    /// session's ticket.
    pub fn release_turn(&self, session: &Session, metrics: &LogMetrics) {
        let ticket = session.ticket();
        if ticket == 0 {
            // An error path may release without ever having ordered.
            return;
        }

        let slot = (ticket.wrapping_add(1) as usize) % NUM_COMMIT_COND;

        let mut state = self.state.lock().unwrap();
        if state.enabled && ticket != state.current {
            self.disable(&mut state, session, metrics, "ticket is not current at release");
        }
        state.current = state.current.wrapping_add(1);
        self.buckets[slot].notify_all();
        drop(state);

        session.set_ticket(0);
    }

    /// Turn group commit off for the rest of the process lifetime. The
    /// transition is logged; it is never undone.
    fn disable(
        &self,
        state: &mut MutexGuard<'_, TicketState>,
        session: &Session,
        metrics: &LogMetrics,
        reason: &str,
    ) {
        if !state.enabled {
            return;
        }
        state.enabled = false;
        metrics.increment_group_commit_disables();
        Logger::error(
            "GROUP_COMMIT_DISABLED",
            &[
                ("current", &state.current.to_string()),
                ("next", &state.next.to_string()),
                ("reason", reason),
                ("session_ticket", &session.ticket().to_string()),
            ],
        );
        for bucket in &self.buckets {
            bucket.notify_all();
        }
    }
}

impl Default for Ticketer {
    fn default() -> Self {
        Self::new()
    }
}

/// What the fsync batcher needs from the state behind the log lock.
pub trait SyncTarget {
    /// Commits since the last fsync, compared against the sync period.
    fn sync_counter(&mut self) -> &mut u64;
    /// Sessions currently parked waiting to share an fsync.
    fn waiting(&mut self) -> &mut u64;
    /// Total fsyncs issued; snapshotted by sleepers to detect that
    /// someone else synced for them.
    fn fsync_count(&mut self) -> &mut u64;
    /// Issue the fsync.
    fn fsync(&mut self) -> io::Result<()>;
}

/// Shares fsyncs between concurrent committers.
///
/// The condvar pairs with the caller's log mutex: a parked session
/// releases the log lock, so other committers can append and either
/// sync for everyone or pile onto the same batch.
pub struct FsyncBatcher {
    cond: Condvar,
}

impl FsyncBatcher {
    pub fn new() -> Self {
        Self {
            cond: Condvar::new(),
        }
    }

    /// Durability step after an append, called with the log lock held;
    /// the guard is returned to the caller still locked.
    ///
    /// Returns whether this call's bytes are durable (true unless the
    /// sync period has not come up yet).
    pub fn flush_and_sync<'a, T: SyncTarget>(
        &self,
        mut guard: MutexGuard<'a, T>,
        ordered: bool,
        pending: u64,
        config: &LogConfig,
        metrics: &LogMetrics,
    ) -> (MutexGuard<'a, T>, io::Result<bool>) {
        let period = config.sync_period();
        if period == 0 {
            return (guard, Ok(false));
        }

        *guard.sync_counter() += 1;
        if *guard.sync_counter() < period {
            return (guard, Ok(false));
        }

        let min_batch = config.group_commit_min_batch();
        let enough_pending = pending >= min_batch;
        // Too many sleepers means everyone is waiting and nobody syncs
        // until the timeout; past half the pending count, sync at once.
        let not_too_many_waiting = enough_pending && *guard.waiting() < pending / 2;

        if ordered && enough_pending && not_too_many_waiting {
            let snapshot = *guard.fsync_count();
            let timeout = Duration::from_micros(config.group_commit_timeout_usec());

            *guard.waiting() += 1;
            let (g, _timed_out) = self.cond.wait_timeout(guard, timeout).unwrap();
            guard = g;
            *guard.waiting() -= 1;

            if *guard.fsync_count() == snapshot {
                // Nobody synced while we slept; do it for the batch.
                *guard.sync_counter() = 0;
                let result = self.timed_fsync(&mut guard, metrics);
                self.cond.notify_all();
                metrics.increment_fsyncs_group_leader();
                if let Err(e) = result {
                    return (guard, Err(e));
                }
            } else {
                // Another session's fsync covered our bytes.
                metrics.increment_fsyncs_grouped();
            }
        } else {
            *guard.sync_counter() = 0;
            let result = self.timed_fsync(&mut guard, metrics);
            // A sleeper may be waiting on this sync.
            self.cond.notify_all();
            metrics.increment_fsyncs_solo();
            if let Err(e) = result {
                return (guard, Err(e));
            }
        }

        (guard, Ok(true))
    }

    fn timed_fsync<T: SyncTarget>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        metrics: &LogMetrics,
    ) -> io::Result<()> {
        let start = Instant::now();
        let result = guard.fsync();
        let micros = start.elapsed().as_micros() as u64;
        *guard.fsync_count() += 1;
        metrics.record_fsync(micros, SLOW_FSYNC_MICROS);
        result
    }
}

impl Default for FsyncBatcher {
    fn default() -> Self {
        Self::new()
    }
}

//! Memory-mapped fixed-slot XID log.
//!
//! A fixed-size file is mapped and divided into equal pages, each a
//! contiguous array of 8-byte XID slots. One page is active and
//! accepts writes; at most one page is being synced at a time; the rest
//! sit in a FIFO pool. `log_xid` claims a slot on the active page and
//! either joins the sync in flight or becomes the syncer itself;
//! `unlog` zeroes the slot. Pool exhaustion waits, it never grows the
//! file.
//!
//! Lock order: active -> pool -> sync -> page. Slots themselves are
//! accessed as atomics, so the map is never reborrowed mutably while
//! writers run.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use memmap2::MmapMut;

use crate::engine::{EngineRecovery, EngineRegistry, TransactionalEngine, Xid, XidSet};
use crate::log::{LogError, LogResult};
use crate::observability::{LogMetrics, Logger};
use crate::session::Session;

use super::{Cookie, TcLog, TcLogError};

/// First bytes of the XID log file.
pub const TC_MAGIC: [u8; 4] = [0xFE, 0x74, 0x63, 0x6C];

/// Magic plus one byte holding the two-phase engine count.
pub const TC_HEADER_SIZE: usize = TC_MAGIC.len() + 1;

/// Bytes per page; every page holds `TC_PAGE_SIZE / 8` slots except
/// page zero, which loses one slot to the header.
pub const TC_PAGE_SIZE: usize = 8192;

/// Minimum page count, guaranteeing a non-empty pool.
pub const TC_MIN_PAGES: usize = 3;

const SLOT_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    /// Idle in the pool.
    Pool,
    /// Taken from the pool, accepting writes.
    Active,
    /// Holds unsynced writes (possibly full), awaiting msync.
    Dirty,
    /// msync failed; slots on this page are not durable.
    Error,
}

#[derive(Debug)]
struct PageCore {
    state: PageState,
    /// Slot scan cursor; every slot before it is occupied.
    cursor: usize,
    free: usize,
    /// Sessions parked waiting for this page's sync.
    waiters: usize,
}

#[derive(Debug)]
struct Page {
    core: Mutex<PageCore>,
    /// Waited on with the sync lock while this page's msync runs.
    cond: Condvar,
    /// Global index of this page's first usable slot.
    slot_base: usize,
    nslots: usize,
}

/// What recovery of an existing XID log found.
#[derive(Debug, Clone)]
pub struct MmapRecovery {
    pub prepared: usize,
    pub engines: EngineRecovery,
}

/// The memory-mapped 2PC coordinator log.
#[derive(Debug)]
pub struct MmapTcLog {
    path: PathBuf,
    map: MmapMut,
    pages: Vec<Page>,
    /// Index of the page accepting writes, if any.
    active: Mutex<Option<usize>>,
    active_cond: Condvar,
    pool: Mutex<VecDeque<usize>>,
    pool_cond: Condvar,
    /// Index of the page being msynced, if any.
    syncing: Mutex<Option<usize>>,
    /// Lock-free shadow of `active` for the syncer's wakeup signal.
    active_hint: AtomicUsize,
    pages_in_use: AtomicU64,
    metrics: Arc<LogMetrics>,
    recovery: Option<MmapRecovery>,
}

impl MmapTcLog {
    /// Open or create the XID log. An existing file means the previous
    /// process died with it open: its non-zero slots are collected and
    /// resolved against the engines before the map is wiped.
    pub fn open(
        path: &Path,
        total_size: u64,
        engines: &EngineRegistry,
        metrics: Arc<LogMetrics>,
    ) -> Result<Self, TcLogError> {
        let file_name = path.display().to_string();
        let engine_count = engines.two_phase_count() as u8;

        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let size = if existed {
            let size = file.metadata()?.len();
            if size == 0 || size % TC_PAGE_SIZE as u64 != 0 {
                return Err(TcLogError::InvalidSize {
                    file: file_name,
                    size,
                });
            }
            size
        } else {
            let pages = (total_size / TC_PAGE_SIZE as u64).max(TC_MIN_PAGES as u64);
            let size = pages * TC_PAGE_SIZE as u64;
            file.set_len(size)?;
            size
        };

        // Safety: the file is exclusively ours for the process
        // lifetime; all concurrent access goes through the atomic slot
        // view below.
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let recovery = if existed {
            Logger::warn("XID_LOG_RECOVERING", &[("file", &file_name)]);
            let report = recover(&mut map, &file_name, engine_count, engines)?;
            Some(report)
        } else {
            None
        };

        map[..TC_MAGIC.len()].copy_from_slice(&TC_MAGIC);
        map[TC_MAGIC.len()] = engine_count;
        map.flush_range(0, TC_PAGE_SIZE)?;

        let npages = (size / TC_PAGE_SIZE as u64) as usize;
        let slots_per_page = TC_PAGE_SIZE / SLOT_BYTES;

        let mut pages = Vec::with_capacity(npages);
        for p in 0..npages {
            // Page zero gives up its first slot to the file header.
            let reserved = if p == 0 { 1 } else { 0 };
            let nslots = slots_per_page - reserved;
            pages.push(Page {
                core: Mutex::new(PageCore {
                    state: if p == 0 {
                        PageState::Active
                    } else {
                        PageState::Pool
                    },
                    cursor: 0,
                    free: nslots,
                    waiters: 0,
                }),
                cond: Condvar::new(),
                slot_base: p * slots_per_page + reserved,
                nslots,
            });
        }

        let pool: VecDeque<usize> = (1..npages).collect();

        Ok(Self {
            path: path.to_path_buf(),
            map,
            pages,
            active: Mutex::new(Some(0)),
            active_cond: Condvar::new(),
            pool: Mutex::new(pool),
            pool_cond: Condvar::new(),
            syncing: Mutex::new(None),
            active_hint: AtomicUsize::new(0),
            pages_in_use: AtomicU64::new(0),
            metrics,
            recovery,
        })
    }

    pub fn recovery_report(&self) -> Option<&MmapRecovery> {
        self.recovery.as_ref()
    }

    pub fn pages_in_use(&self) -> u64 {
        self.pages_in_use.load(Ordering::Relaxed)
    }

    /// Atomic view of one slot.
    ///
    /// Safety of the cast: the map is page-aligned, slots are 8 bytes
    /// apart, and every mutation of slot memory goes through this view.
    fn slot(&self, index: usize) -> &AtomicU64 {
        let offset = index * SLOT_BYTES;
        debug_assert!(offset + SLOT_BYTES <= self.map.len());
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn page_of_cookie(&self, cookie: Cookie) -> usize {
        (cookie as usize) / TC_PAGE_SIZE
    }

    /// Pick a page from the pool: the head if nobody waits on it,
    /// otherwise the pool page with the most free slots. Waits when the
    /// pool is empty.
    fn take_from_pool(&self) -> usize {
        let mut pool = self.pool.lock().unwrap();
        loop {
            let mut best: Option<(usize, usize, usize)> = None; // (queue idx, page, free)
            for (qi, &p) in pool.iter().enumerate() {
                let core = self.pages[p].core.lock().unwrap();
                if core.waiters == 0 {
                    if qi == 0 {
                        best = Some((0, p, core.free));
                        break;
                    }
                    match best {
                        Some((_, _, f)) if f >= core.free => {}
                        _ => best = Some((qi, p, core.free)),
                    }
                }
            }

            if let Some((qi, p, free)) = best {
                if free > 0 {
                    pool.remove(qi);
                    let mut core = self.pages[p].core.lock().unwrap();
                    core.state = PageState::Active;
                    return p;
                }
            }

            // Pool exhausted (or only waiter-laden/full pages): wait.
            self.metrics.increment_page_waits();
            pool = self.pool_cond.wait(pool).unwrap();
        }
    }

    /// msync one page, move it to the pool tail, wake its waiters and
    /// hand the syncer role to whoever wants it next.
    fn sync_page(&self, p: usize) -> io::Result<()> {
        let offset = p * TC_PAGE_SIZE;
        let result = self.map.flush_range(offset, TC_PAGE_SIZE);

        {
            let mut pool = self.pool.lock().unwrap();
            let mut core = self.pages[p].core.lock().unwrap();
            core.state = if result.is_err() {
                PageState::Error
            } else {
                PageState::Pool
            };
            pool.push_back(p);
            drop(core);
            self.pool_cond.notify_one();
        }

        {
            let mut syncing = self.syncing.lock().unwrap();
            *syncing = None;
            // Waiters park on the page cond with the sync lock, so
            // notifying under it cannot lose a wakeup.
            self.pages[p].cond.notify_all();
            // A writer on the now-active page may be waiting to sync.
            let hint = self.active_hint.load(Ordering::Relaxed);
            if hint != usize::MAX && hint != p {
                self.pages[hint].cond.notify_one();
            }
        }

        result
    }

    fn set_active(&self, slot: &mut Option<usize>, value: Option<usize>) {
        *slot = value;
        self.active_hint
            .store(value.unwrap_or(usize::MAX), Ordering::Relaxed);
    }

    fn sync_failed(&self) -> LogError {
        LogError::SyncFailed {
            file: self.path.display().to_string(),
            source: io::Error::new(io::ErrorKind::Other, "msync failed"),
        }
    }
}

impl TcLog for MmapTcLog {
    /// Claim a slot on the active page and make it durable. The cookie
    /// is the byte offset of the slot; it can never be zero because
    /// slot zero belongs to the header.
    fn log_xid(
        &self,
        _session: &Session,
        xid: Xid,
        _engine: Option<&dyn TransactionalEngine>,
    ) -> LogResult<Cookie> {
        debug_assert_ne!(xid, 0);

        let mut active = self.active.lock().unwrap();

        // Find an active page with room.
        loop {
            match *active {
                Some(p) => {
                    if self.pages[p].core.lock().unwrap().free > 0 {
                        break;
                    }
                    // Full page; its last writer is becoming the
                    // syncer and will clear the active slot.
                    self.metrics.increment_page_waits();
                    active = self.active_cond.wait(active).unwrap();
                }
                None => {
                    let p = self.take_from_pool();
                    self.set_active(&mut active, Some(p));
                }
            }
        }
        let p = match *active {
            Some(p) => p,
            None => unreachable!("active page chosen above"),
        };
        let page = &self.pages[p];

        // Claim a slot. Every slot below the cursor is occupied, so the
        // first hole at or after it is ours.
        let cookie = {
            let mut core = page.core.lock().unwrap();
            while core.cursor < page.nslots
                && self.slot(page.slot_base + core.cursor).load(Ordering::Acquire) != 0
            {
                core.cursor += 1;
            }
            debug_assert!(core.cursor < page.nslots);
            let index = page.slot_base + core.cursor;
            self.slot(index).store(xid, Ordering::Release);
            core.cursor += 1;
            if core.free == page.nslots {
                self.pages_in_use.fetch_add(1, Ordering::Relaxed);
            }
            core.free -= 1;
            core.state = PageState::Dirty;
            (index * SLOT_BYTES) as Cookie
        };

        // To sync or not to sync.
        let mut syncing = self.syncing.lock().unwrap();
        if syncing.is_none() {
            // The sync seat is vacant: take it, retire the active page.
            *syncing = Some(p);
            self.set_active(&mut active, None);
            self.active_cond.notify_all();
            drop(syncing);
            drop(active);
            return match self.sync_page(p) {
                Ok(()) => Ok(cookie),
                Err(_) => Err(self.sync_failed()),
            };
        }
        drop(active);

        // Somebody is syncing; wait for our page to be covered.
        {
            page.core.lock().unwrap().waiters += 1;
        }
        loop {
            let state = page.core.lock().unwrap().state;

            if state == PageState::Dirty && syncing.is_some() {
                syncing = page.cond.wait(syncing).unwrap();
                continue;
            }

            if state != PageState::Dirty {
                // Our page was synced (or failed) while we waited.
                let mut core = page.core.lock().unwrap();
                core.waiters -= 1;
                let no_waiters = core.waiters == 0;
                drop(core);
                drop(syncing);
                if no_waiters {
                    self.pool_cond.notify_one();
                }
                return if state == PageState::Error {
                    Err(self.sync_failed())
                } else {
                    Ok(cookie)
                };
            }

            // Still dirty and the sync seat is vacant: become the
            // syncer, re-acquiring locks in hierarchy order.
            drop(syncing);
            let mut active = self.active.lock().unwrap();
            let mut reacquired = self.syncing.lock().unwrap();
            if reacquired.is_some() {
                drop(active);
                syncing = reacquired;
                continue;
            }
            *reacquired = Some(p);
            if *active == Some(p) {
                self.set_active(&mut active, None);
                self.active_cond.notify_all();
            }
            drop(reacquired);
            drop(active);

            {
                let mut core = page.core.lock().unwrap();
                core.waiters -= 1;
            }
            return match self.sync_page(p) {
                Ok(()) => Ok(cookie),
                Err(_) => Err(self.sync_failed()),
            };
        }
    }

    /// Erase the slot and update the page's accounting. An empty page
    /// stays wherever it is; the pool signal lets a session stuck in
    /// overflow retry.
    fn unlog(&self, _session: &Session, cookie: Cookie, xid: Xid) -> LogResult<()> {
        let index = cookie as usize / SLOT_BYTES;
        let p = self.page_of_cookie(cookie);
        let page = &self.pages[p];
        debug_assert!(index >= page.slot_base && index < page.slot_base + page.nslots);

        let previous = self.slot(index).swap(0, Ordering::AcqRel);
        debug_assert_eq!(previous, xid);
        let _ = previous;

        let mut core = page.core.lock().unwrap();
        core.free += 1;
        debug_assert!(core.free <= page.nslots);
        let relative = index - page.slot_base;
        if relative < core.cursor {
            core.cursor = relative;
        }
        if core.free == page.nslots {
            self.pages_in_use.fetch_sub(1, Ordering::Relaxed);
        }
        let no_waiters = core.waiters == 0;
        drop(core);

        if no_waiters {
            self.pool_cond.notify_one();
        }
        Ok(())
    }

    /// Clean shutdown deletes the file: an absent log means nothing was
    /// pending.
    fn close(&self) -> LogResult<()> {
        self.map.flush()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Collect every non-zero slot of an existing map, resolve the set
/// against the engines, and wipe the map.
fn recover(
    map: &mut MmapMut,
    file_name: &str,
    engine_count: u8,
    engines: &EngineRegistry,
) -> Result<MmapRecovery, TcLogError> {
    if map[..TC_MAGIC.len()] != TC_MAGIC {
        return Err(TcLogError::BadMagic {
            file: file_name.to_string(),
        });
    }

    let recorded = map[TC_MAGIC.len()];
    if recorded != engine_count {
        return Err(TcLogError::EngineCountMismatch {
            file: file_name.to_string(),
            expected: recorded,
            found: engine_count,
        });
    }

    let mut xids = XidSet::new();
    let slots = map.len() / SLOT_BYTES;
    for index in 1..slots {
        let offset = index * SLOT_BYTES;
        let raw: [u8; 8] = map[offset..offset + SLOT_BYTES].try_into().unwrap();
        let xid = u64::from_ne_bytes(raw);
        if xid != 0 {
            xids.insert(xid);
        }
    }

    let outcome = engines.recover_all(&xids)?;

    for byte in map.iter_mut() {
        *byte = 0;
    }

    Logger::info(
        "XID_LOG_RECOVERED",
        &[
            ("file", file_name),
            ("prepared", &xids.len().to_string()),
        ],
    );

    Ok(MmapRecovery {
        prepared: xids.len(),
        engines: outcome,
    })
}

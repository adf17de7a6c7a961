//! Memory-mapped commit log
//!
//! File layout: a 4-byte magic and one byte holding the engine count, then
//! equal pages of 8-byte little-endian xid slots. Page 0 gives up its
//! first bytes to the header, so its slots start at the first 8-byte
//! boundary that leaves room for it. A zero slot is free.
//!
//! Locks:
//!
//! - `active`: which page receives new xids
//! - `pool`: pages waiting to become active
//! - `syncing`: the single page being synced
//! - one lock per page guarding its [`PageCtl`]
//!
//! A thread holds at most one page lock and one of the global locks. The
//! only orders used are active -> page, pool -> page and page -> syncing.
//!
//! A file found at open means the previous process did not close cleanly:
//! every non-zero slot is an xid whose commit was decided but possibly not
//! applied, and the engines are asked to resolve them before anything else
//! happens. A clean close garbles the magic and deletes the file.

use std::collections::{BTreeSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::CommitLogConfig;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event, Event, MetricsRegistry};
use crate::session::Session;

use super::engine::{EngineSet, RecoveryReport};
use super::errors::{TcError, TcResult};
use super::page::{choose_pool_page, waiter_decision, PageCtl, PageEvent, PageState, WaitDecision};
use super::{CommitLog, Cookie, Xid};

/// Commit-log file signature
pub const TC_MAGIC: [u8; 4] = [254, 0x23, 0x05, 0x74];

/// Magic plus the engine-count byte
const HEADER_SIZE: usize = TC_MAGIC.len() + 1;

const SLOT_SIZE: usize = std::mem::size_of::<u64>();

/// Longest single sleep on any commit-log condition variable
const WAIT_SLICE: Duration = Duration::from_millis(200);

struct Page {
    ctl: Mutex<PageCtl>,
    /// Signalled when the page's sync finishes or the sync slot frees up
    cond: Condvar,
    /// Byte offset of the page's first slot
    first_slot: usize,
}

/// Byte offset of the first slot of `page` and the number of slots in it
fn page_layout(page_size: usize, page: usize) -> (usize, usize) {
    let start = page * page_size;
    if page == 0 {
        let slots = (page_size - HEADER_SIZE) / SLOT_SIZE;
        (start + page_size - slots * SLOT_SIZE, slots)
    } else {
        (start, page_size / SLOT_SIZE)
    }
}

/// Non-zero slots of a raw commit-log image
fn scan_slots(data: &[u8], page_size: usize) -> BTreeSet<Xid> {
    let pages = data.len() / page_size;
    let mut xids = BTreeSet::new();
    for page in 0..pages {
        let (first, slots) = page_layout(page_size, page);
        for slot in 0..slots {
            let at = first + slot * SLOT_SIZE;
            let mut raw = [0u8; SLOT_SIZE];
            raw.copy_from_slice(&data[at..at + SLOT_SIZE]);
            let xid = u64::from_le_bytes(raw);
            if xid != 0 {
                xids.insert(xid);
            }
        }
    }
    xids
}

/// Checks the header of a commit-log image and returns its engine count
fn check_header(data: &[u8], path: &Path) -> TcResult<u8> {
    if data.len() < HEADER_SIZE || data[..TC_MAGIC.len()] != TC_MAGIC {
        return Err(TcError::bad_magic(&path.display().to_string()));
    }
    Ok(data[TC_MAGIC.len()])
}

/// Read-only view of a commit-log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapInspection {
    pub path: PathBuf,
    /// Engine count recorded at creation
    pub engines: u8,
    pub pages: usize,
    /// Xids still recorded in the file
    pub xids: BTreeSet<Xid>,
}

/// Commit log in a memory-mapped file of xid slots
pub struct MmapCommitLog {
    path: PathBuf,
    page_size: usize,
    map: MmapMut,
    _file: File,
    pages: Vec<Page>,
    active: Mutex<Option<usize>>,
    active_cond: Condvar,
    pool: Mutex<VecDeque<usize>>,
    pool_cond: Condvar,
    syncing: Mutex<Option<usize>>,
    closed: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

impl MmapCommitLog {
    /// Opens the commit log at `config.path`.
    ///
    /// A missing file is created at `config.size`. An existing file is a
    /// crash leftover: its xids are handed to `engines` for resolution and
    /// the file is wiped before reuse.
    ///
    /// # Errors
    ///
    /// - `AERO_TC_BAD_MAGIC` if an existing file is not a commit log
    /// - `AERO_TC_ENGINE_MISMATCH` if it was created for another engine count
    /// - `AERO_TC_RECOVERY_FAILED` if an engine cannot resolve its xids
    /// - `AERO_TC_IO` if the file cannot be created, sized or mapped
    pub fn open(
        config: &CommitLogConfig,
        engines: &EngineSet,
        metrics: Arc<MetricsRegistry>,
    ) -> TcResult<(Self, Option<RecoveryReport>)> {
        config
            .validate()
            .map_err(|e| TcError::invalid_config(e.to_string()))?;
        let engine_count = u8::try_from(engines.len())
            .map_err(|_| TcError::invalid_config("more than 255 engines"))?;
        let page_size = config.page_size;
        let path = config.path.clone();

        let (file, crashed) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|e| {
                        TcError::io(format!("Failed to create {}", path.display()), e)
                    })?;
                file.set_len(config.size).map_err(|e| {
                    TcError::io(format!("Failed to size {}", path.display()), e)
                })?;
                (file, false)
            }
            Err(e) => {
                return Err(TcError::io(format!("Failed to open {}", path.display()), e));
            }
        };

        let len = file
            .metadata()
            .map_err(|e| TcError::io(format!("Failed to stat {}", path.display()), e))?
            .len();
        if len % page_size as u64 != 0 || len / (page_size as u64) < CommitLogConfig::MIN_PAGES {
            return Err(TcError::corruption(format!(
                "{} is {} bytes, not a whole number of at least {} pages of {}",
                path.display(),
                len,
                CommitLogConfig::MIN_PAGES,
                page_size
            )));
        }

        // SAFETY: the file stays open for the life of the mapping and is
        // not resized while mapped.
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| TcError::io(format!("Failed to map {}", path.display()), e))?;

        let report = if crashed {
            let report = recover_image(&map, page_size, &path, engines)?;
            metrics.add_recovered_xids(report.resolved().len() as u64);
            map.fill(0);
            Some(report)
        } else {
            None
        };

        map[..TC_MAGIC.len()].copy_from_slice(&TC_MAGIC);
        map[TC_MAGIC.len()] = engine_count;
        map.flush_range(0, page_size)
            .map_err(|e| TcError::sync_failed("Failed to sync commit log header", e))?;

        let npages = map.len() / page_size;
        let pages: Vec<Page> = (0..npages)
            .map(|i| {
                let (first_slot, slots) = page_layout(page_size, i);
                Page {
                    ctl: Mutex::new(PageCtl::new(slots)),
                    cond: Condvar::new(),
                    first_slot,
                }
            })
            .collect();
        pages[0]
            .ctl
            .lock()
            .apply(PageEvent::Activate)
            .map_err(|e| TcError::corruption(e.to_string()))?;

        log_event(
            Event::TcOpen,
            &[
                ("backend", "mmap"),
                ("path", &path.display().to_string()),
                ("pages", &npages.to_string()),
            ],
        );

        let log = Self {
            path,
            page_size,
            map,
            _file: file,
            pages,
            active: Mutex::new(Some(0)),
            active_cond: Condvar::new(),
            pool: Mutex::new((1..npages).collect()),
            pool_cond: Condvar::new(),
            syncing: Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics,
        };
        Ok((log, report))
    }

    /// Reads the xids recorded in a commit-log file without opening it
    pub fn inspect(path: &Path, page_size: usize) -> TcResult<MmapInspection> {
        let data = fs::read(path)
            .map_err(|e| TcError::io(format!("Failed to read {}", path.display()), e))?;
        let engines = check_header(&data, path)?;
        if page_size == 0 || data.len() % page_size != 0 {
            return Err(TcError::corruption(format!(
                "{} is not a whole number of {}-byte pages",
                path.display(),
                page_size
            )));
        }
        Ok(MmapInspection {
            path: path.to_path_buf(),
            engines,
            pages: data.len() / page_size,
            xids: scan_slots(&data, page_size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Slots of one page
    pub fn page_slots(&self, page: usize) -> Option<usize> {
        self.pages.get(page).map(|p| p.ctl.lock().size)
    }

    fn slot(&self, page: usize, slot: usize) -> &AtomicU64 {
        let offset = self.pages[page].first_slot + slot * SLOT_SIZE;
        debug_assert!(offset + SLOT_SIZE <= self.map.len());
        // SAFETY: `offset` lies inside the mapping and is 8-byte aligned
        // (the mapping is page aligned and every slot offset is a multiple
        // of 8). After open, slot memory is only accessed through atomics.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn magic_byte(&self) -> &AtomicU8 {
        // SAFETY: offset 0 is inside the mapping; after open the header is
        // only written through this atomic, on close.
        unsafe { &*(self.map.as_ptr() as *const AtomicU8) }
    }

    fn check_open(&self) -> TcResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TcError::closed());
        }
        Ok(())
    }

    // ==================== Logging ====================

    /// Writes `xid` into a free slot of the active page.
    ///
    /// Returns the page, the slot and the sync generation that makes the
    /// slot durable. The caller is counted as a waiter of the page.
    fn claim_slot(&self, xid: Xid) -> TcResult<(usize, usize, u64)> {
        let mut active = self.active.lock();
        loop {
            let page = match *active {
                Some(page) => page,
                None => {
                    let page = MutexGuard::unlocked(&mut active, || self.take_from_pool());
                    if active.is_some() {
                        MutexGuard::unlocked(&mut active, || self.return_to_pool(page));
                        continue;
                    }
                    self.pages[page]
                        .ctl
                        .lock()
                        .apply(PageEvent::Activate)
                        .map_err(|e| TcError::corruption(e.to_string()))?;
                    *active = Some(page);
                    page
                }
            };

            let mut ctl = self.pages[page].ctl.lock();
            if ctl.is_full() {
                drop(ctl);
                self.active_cond.wait_for(&mut active, WAIT_SLICE);
                continue;
            }

            let slot = (ctl.hint..ctl.size)
                .find(|&s| self.slot(page, s).load(Ordering::Acquire) == 0)
                .ok_or_else(|| {
                    TcError::corruption(format!(
                        "page {} counts {} free slots but none is empty",
                        page, ctl.free
                    ))
                })?;
            self.slot(page, slot).store(xid.to_le(), Ordering::Release);
            maybe_crash(points::TC_AFTER_SLOT_WRITE);

            ctl.free -= 1;
            ctl.hint = slot + 1;
            ctl.apply(PageEvent::SlotWritten)
                .map_err(|e| TcError::corruption(e.to_string()))?;
            ctl.waiters += 1;
            return Ok((page, slot, ctl.synced_gen + 1));
        }
    }

    /// Removes the best pool page, waiting while none can be used
    fn take_from_pool(&self) -> usize {
        let mut pool = self.pool.lock();
        let mut waited = false;
        loop {
            let candidates: Vec<(u32, usize)> = pool
                .iter()
                .map(|&p| {
                    let ctl = self.pages[p].ctl.lock();
                    (ctl.waiters, ctl.free)
                })
                .collect();
            if let Some(page) = choose_pool_page(&candidates).and_then(|i| pool.remove(i)) {
                return page;
            }
            if !waited {
                self.metrics.increment_tc_page_waits();
                waited = true;
            }
            self.pool_cond.wait_for(&mut pool, WAIT_SLICE);
        }
    }

    fn return_to_pool(&self, page: usize) {
        self.pool.lock().push_front(page);
        self.pool_cond.notify_all();
    }

    /// Waits until the sync covering generation `my_gen` of `page` is done,
    /// syncing the page itself when nobody else is
    fn wait_synced(&self, page: usize, my_gen: u64) -> TcResult<()> {
        let p = &self.pages[page];
        let mut ctl = p.ctl.lock();
        loop {
            let decision = {
                let mut syncing = self.syncing.lock();
                let decision = waiter_decision(&ctl, my_gen, syncing.is_none());
                if decision == WaitDecision::BecomeSyncer {
                    *syncing = Some(page);
                }
                decision
            };

            match decision {
                WaitDecision::Done { failed } => {
                    ctl.waiters -= 1;
                    let reusable = ctl.waiters == 0 && ctl.state == PageState::Pool;
                    drop(ctl);
                    if reusable {
                        let _pool = self.pool.lock();
                        self.pool_cond.notify_all();
                    }
                    return if failed {
                        Err(TcError::page_sync_failed(page))
                    } else {
                        Ok(())
                    };
                }
                WaitDecision::Wait => {
                    p.cond.wait_for(&mut ctl, WAIT_SLICE);
                }
                WaitDecision::BecomeSyncer => return self.sync_page(page, ctl),
            }
        }
    }

    /// Syncs `page` while holding the sync slot.
    ///
    /// The page stops being active before the sync starts, so every slot
    /// written into it is covered.
    fn sync_page(&self, page: usize, mut ctl: MutexGuard<'_, PageCtl>) -> TcResult<()> {
        let p = &self.pages[page];
        ctl.apply(PageEvent::SyncStarted)
            .map_err(|e| TcError::corruption(e.to_string()))?;
        drop(ctl);

        {
            let mut active = self.active.lock();
            if *active == Some(page) {
                *active = None;
            }
            self.active_cond.notify_all();
        }

        maybe_crash(points::TC_BEFORE_SYNC);
        let start = page * self.page_size;
        let result = self.map.flush_range(start, self.page_size);
        self.metrics.increment_tc_page_syncs();

        {
            let mut ctl = p.ctl.lock();
            ctl.apply(PageEvent::SyncFinished { ok: result.is_ok() })
                .map_err(|e| TcError::corruption(e.to_string()))?;
            ctl.waiters -= 1;
            p.cond.notify_all();
        }
        {
            self.pool.lock().push_back(page);
            self.pool_cond.notify_all();
        }
        *self.syncing.lock() = None;

        let next = *self.active.lock();
        if let Some(next) = next {
            let _ctl = self.pages[next].ctl.lock();
            self.pages[next].cond.notify_all();
        }

        result.map_err(|e| {
            log_event(
                Event::TcPageSyncFailed,
                &[("page", &page.to_string()), ("error", &e.to_string())],
            );
            TcError::sync_failed(format!("Failed to sync commit log page {}", page), e)
        })
    }

    /// Xids currently held in slots
    fn live_xids(&self) -> BTreeSet<Xid> {
        let mut xids = BTreeSet::new();
        for (page, p) in self.pages.iter().enumerate() {
            let size = p.ctl.lock().size;
            for slot in 0..size {
                let xid = u64::from_le(self.slot(page, slot).load(Ordering::Acquire));
                if xid != 0 {
                    xids.insert(xid);
                }
            }
        }
        xids
    }
}

/// Hands the xids of a crashed image to the engines
fn recover_image(
    data: &[u8],
    page_size: usize,
    path: &Path,
    engines: &EngineSet,
) -> TcResult<RecoveryReport> {
    let path_str = path.display().to_string();
    log_event(Event::TcRecoveryBegin, &[("backend", "mmap"), ("path", &path_str)]);

    let result = check_header(data, path).and_then(|count| {
        if count as usize != engines.len() {
            return Err(TcError::engine_mismatch(count, engines.len()));
        }
        let xids = scan_slots(data, page_size);
        engines
            .recover(&xids)
            .map_err(|e| TcError::recovery_failed(e.to_string()))
    });

    match &result {
        Ok(report) => log_event(
            Event::TcRecoveryComplete,
            &[
                ("backend", "mmap"),
                ("committed", &report.committed.len().to_string()),
                ("resolved", &report.resolved().len().to_string()),
            ],
        ),
        Err(e) => log_event(
            Event::TcRecoveryFailed,
            &[("path", &path_str), ("error", &e.to_string())],
        ),
    }
    result
}

impl CommitLog for MmapCommitLog {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn log_xid(&self, _session: &mut Session, xid: Xid) -> TcResult<Cookie> {
        self.check_open()?;
        if xid == 0 {
            return Err(TcError::invalid_cookie("xid 0 marks a free slot"));
        }
        let (page, slot, my_gen) = self.claim_slot(xid)?;
        self.wait_synced(page, my_gen)?;
        self.metrics.increment_tc_xids_logged();
        Ok(Cookie::Slot { page, slot })
    }

    fn unlog(&self, cookie: Cookie, xid: Xid) -> TcResult<()> {
        self.check_open()?;
        let (page, slot) = match cookie {
            Cookie::Slot { page, slot } => (page, slot),
            Cookie::Logged { .. } => {
                return Err(TcError::invalid_cookie(
                    "cookie was not issued by the mmap commit log",
                ))
            }
        };
        let p = self.pages.get(page).ok_or_else(|| {
            TcError::invalid_cookie(format!("page {} is out of range", page))
        })?;

        let mut ctl = p.ctl.lock();
        if slot >= ctl.size {
            return Err(TcError::invalid_cookie(format!(
                "slot {} is out of range for page {}",
                slot, page
            )));
        }
        let cell = self.slot(page, slot);
        let stored = u64::from_le(cell.load(Ordering::Acquire));
        if stored != xid {
            return Err(TcError::invalid_cookie(format!(
                "slot {}:{} holds xid {}, not {}",
                page, slot, stored, xid
            )));
        }
        cell.store(0, Ordering::Release);
        ctl.free += 1;
        ctl.hint = ctl.hint.min(slot);
        ctl.apply(PageEvent::SlotFreed)
            .map_err(|e| TcError::corruption(e.to_string()))?;

        let unwatched = ctl.waiters == 0;
        drop(ctl);
        if unwatched {
            let _pool = self.pool.lock();
            self.pool_cond.notify_all();
        }
        Ok(())
    }

    fn recover(&self) -> TcResult<BTreeSet<Xid>> {
        self.check_open()?;
        Ok(self.live_xids())
    }

    /// Garbles the magic and deletes the file.
    ///
    /// The magic is garbled first so a failed delete still leaves a file
    /// the next open rejects instead of recovering from.
    fn close(&self) -> TcResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.magic_byte().store(b'A', Ordering::Release);
        self.map
            .flush_range(0, self.page_size)
            .map_err(|e| TcError::sync_failed("Failed to sync commit log header", e))?;
        fs::remove_file(&self.path)
            .map_err(|e| TcError::io(format!("Failed to delete {}", self.path.display()), e))?;
        log_event(
            Event::TcClose,
            &[("backend", "mmap"), ("path", &self.path.display().to_string())],
        );
        Ok(())
    }
}

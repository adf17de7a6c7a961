//! Log writer: append, rotate, purge
//!
//! One writer owns one active log file plus the index of every file it has
//! produced. Two locks guard that state and are always taken file lock
//! first, index lock second:
//!
//! - the file lock serializes appends, syncs and rotation
//! - the index lock serializes index rewrites and purges
//!
//! Purge only takes the index lock, so unlinking old files never blocks
//! appends. The active file is always the last index entry.
//!
//! An I/O failure while appending, syncing or rotating moves the writer to
//! `Disabled`. Every later write returns `AERO_LOG_DISABLED` with the
//! original reason until [`LogWriter::reopen`] is called.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::config::LogConfig;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event, log_event_at, Event, MetricsRegistry, Severity};

use super::cache::TransactionCache;
use super::errors::{LogError, LogResult};
use super::group_commit::{GroupCommitCoordinator, SyncOutcome, Ticket};
use super::index::{sync_dir, LogIndex};
use super::record::{RecordBody, FLAG_IN_USE, LOG_MAGIC};
use super::recovery::{release_after_crash, scan_log_file, set_in_use_flag};
use super::relocate::write_cache;

/// Reason carried by incident records written for a flagged transaction
const LOST_EVENTS_MESSAGE: &str =
    "non-transactional changes in this transaction were not logged; replicas may diverge";

/// How a written transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Commit,
    Rollback,
    /// Two-phase commit decision for the given transaction id
    Xid(u64),
}

impl Marker {
    fn body(self) -> RecordBody {
        match self {
            Marker::Commit => RecordBody::commit(),
            Marker::Rollback => RecordBody::rollback(),
            Marker::Xid(xid) => RecordBody::Xid(xid),
        }
    }

    pub fn is_xid(self) -> bool {
        matches!(self, Marker::Xid(_))
    }
}

/// Writer lifecycle.
///
/// `Operational -> Disabled` is one-way until an explicit `reopen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterStatus {
    Operational,
    Disabled(String),
    Closed,
}

/// What a call to [`LogWriter::write`] did
#[derive(Debug)]
pub struct WriteReceipt {
    /// Commit-order ticket, issued to XID writes when group commit is on
    pub ticket: Option<Ticket>,
    pub sync: SyncOutcome,
    /// Bytes appended; zero for a no-op write
    pub bytes: u64,
    /// An XID write filled the file; rotation waits until it is unlogged
    pub log_full: bool,
}

impl WriteReceipt {
    pub(crate) fn nothing_written() -> Self {
        Self {
            ticket: None,
            sync: SyncOutcome::Skipped,
            bytes: 0,
            log_full: false,
        }
    }
}

/// A reader of log files, such as a replication sender.
///
/// Files it reports in use are never purged, nor is anything after them.
pub trait LogConsumer: Send + Sync {
    fn is_file_in_use(&self, name: &str) -> bool;
}

struct ActiveFile {
    name: String,
    file: File,
    position: u64,
}

struct FileState {
    status: WriterStatus,
    active: Option<ActiveFile>,
    writes_since_sync: u64,
    /// Rotation in progress: XID writes must wait
    draining: bool,
}

impl FileState {
    fn check_status(&self) -> LogResult<()> {
        match &self.status {
            WriterStatus::Operational => Ok(()),
            WriterStatus::Disabled(reason) => Err(LogError::disabled(reason.clone())),
            WriterStatus::Closed => Err(LogError::not_open()),
        }
    }

    fn position(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.position)
    }
}

/// Counts committers inside `write` for the group-commit threshold
struct InFlight<'a>(&'a AtomicU32);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Append-only writer of rotated, indexed log files
pub struct LogWriter {
    config: LogConfig,
    state: Mutex<FileState>,
    drain_cond: Condvar,
    index: Mutex<LogIndex>,
    /// XIDs written but not yet unlogged
    prepared: Mutex<u64>,
    prepared_cond: Condvar,
    in_flight: AtomicU32,
    consumer: RwLock<Option<Arc<dyn LogConsumer>>>,
    group_commit: GroupCommitCoordinator,
    metrics: Arc<MetricsRegistry>,
}

impl LogWriter {
    /// Opens the log directory and starts a new active file.
    ///
    /// Finishes a purge interrupted by a crash, then releases the newest
    /// file if the previous process never closed it: the file is cut back
    /// to its last complete transaction and its in-use flag cleared.
    ///
    /// # Errors
    ///
    /// Fails if the index cannot be read, an interrupted purge cannot be
    /// finished, the newest file is structurally corrupt, or the new file
    /// cannot be created.
    pub fn open(config: LogConfig, metrics: Arc<MetricsRegistry>) -> LogResult<Self> {
        let mut index = LogIndex::open(&config.log_dir, &config.base_name)?;

        if let Some(names) = index.read_purge_intent()? {
            let purged = finish_purge(&mut index, &names, &metrics)?;
            log_event(Event::LogPurgeReplayed, &[("files", &purged.join(","))]);
        }

        if let Some(last) = index.last() {
            let path = index.file_path(last);
            if path.exists() {
                let scan = scan_log_file(&path)?;
                if scan.in_use {
                    if scan.needs_truncation() {
                        log_event(
                            Event::TcLogTruncated,
                            &[
                                ("file", last),
                                ("valid_pos", &scan.valid_pos.to_string()),
                                ("file_len", &scan.file_len.to_string()),
                            ],
                        );
                    }
                    release_after_crash(&scan)?;
                }
            }
        }

        let name = index.next_file_name()?;
        let active = create_log_file(&index, &name, config.server_id)?;
        index.append(&name)?;
        log_event(
            Event::LogOpen,
            &[("file", &name), ("dir", &config.log_dir.display().to_string())],
        );

        let group_commit =
            GroupCommitCoordinator::new(config.group_commit.clone(), Arc::clone(&metrics));
        Ok(Self {
            config,
            state: Mutex::new(FileState {
                status: WriterStatus::Operational,
                active: Some(active),
                writes_since_sync: 0,
                draining: false,
            }),
            drain_cond: Condvar::new(),
            index: Mutex::new(index),
            prepared: Mutex::new(0),
            prepared_cond: Condvar::new(),
            in_flight: AtomicU32::new(0),
            consumer: RwLock::new(None),
            group_commit,
            metrics,
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn group_commit(&self) -> &GroupCommitCoordinator {
        &self.group_commit
    }

    /// Registers the reader whose in-use files purge must keep
    pub fn set_consumer(&self, consumer: Arc<dyn LogConsumer>) {
        *self.consumer.write() = Some(consumer);
    }

    pub fn status(&self) -> WriterStatus {
        self.state.lock().status.clone()
    }

    pub fn is_operational(&self) -> bool {
        self.state.lock().status == WriterStatus::Operational
    }

    /// Name of the active file, if one is open
    pub fn active_file(&self) -> Option<String> {
        self.state.lock().active.as_ref().map(|a| a.name.clone())
    }

    /// Append position in the active file
    pub fn position(&self) -> u64 {
        self.state.lock().position()
    }

    /// Indexed file names, oldest first
    pub fn index_entries(&self) -> Vec<String> {
        self.index.lock().entries().to_vec()
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.index.lock().file_path(name)
    }

    /// Writes one transaction and makes it durable.
    ///
    /// The cache is framed as `BEGIN`, cache contents, `marker`, followed by
    /// an incident record when `incident` is set or the cache carries the
    /// incident flag. An empty cache with no incident writes nothing; an
    /// empty cache with an incident writes only the incident record.
    ///
    /// XID writes wait while a rotation is draining, are counted as
    /// prepared until [`LogWriter::release_prepared`], get a commit ticket
    /// when `ordering_required` and group commit is on, and never rotate
    /// themselves: `log_full` in the receipt asks the caller to rotate
    /// after unlogging.
    ///
    /// The cache is reset whatever the outcome.
    ///
    /// # Errors
    ///
    /// - `AERO_LOG_DISABLED` if an earlier failure disabled logging
    /// - `AERO_LOG_WRITE_FAILED` / `AERO_LOG_FSYNC_FAILED` on I/O failure,
    ///   which also disables logging
    /// - `AERO_LOG_CACHE_FULL` if the open row batch no longer fits
    pub fn write(
        &self,
        cache: &mut TransactionCache,
        marker: Marker,
        incident: bool,
        ordering_required: bool,
    ) -> LogResult<WriteReceipt> {
        let result = self.write_transaction(cache, marker, incident, ordering_required);
        cache.reset();
        result
    }

    fn write_transaction(
        &self,
        cache: &mut TransactionCache,
        marker: Marker,
        incident: bool,
        ordering_required: bool,
    ) -> LogResult<WriteReceipt> {
        cache.flush_pending()?;
        let incident = incident || cache.has_incident();
        let _in_flight = InFlight::enter(&self.in_flight);

        let mut state = self.state.lock();
        if marker.is_xid() {
            while state.draining {
                self.drain_cond.wait(&mut state);
            }
        }
        state.check_status()?;

        if cache.is_empty() && !incident {
            if marker.is_xid() {
                *self.prepared.lock() += 1;
            }
            return Ok(WriteReceipt::nothing_written());
        }

        let server_id = self.config.server_id;
        let start = state.position();
        let mut buf = Vec::with_capacity(cache.contents().len() + 128);
        if !cache.is_empty() {
            buf.extend(RecordBody::begin().encode(server_id, 0, start));
            write_cache(
                cache.contents(),
                start + buf.len() as u64,
                self.config.cache_read_buffer,
                &mut buf,
            )
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidInput => {
                    LogError::write_failed("Transaction does not fit in the log file", e)
                }
                _ => LogError::corruption(format!("Malformed transaction cache: {}", e)),
            })?;
            buf.extend(marker.body().encode(server_id, 0, start + buf.len() as u64));
        }
        if incident {
            buf.extend(
                RecordBody::lost_events(LOST_EVENTS_MESSAGE).encode(
                    server_id,
                    0,
                    start + buf.len() as u64,
                ),
            );
        }

        self.append_locked(&mut state, &buf)?;
        if !cache.is_empty() {
            self.metrics.increment_log_transactions();
        }
        if incident {
            self.metrics.increment_log_incidents();
        }

        // Ticket order is append order: both happen under the file lock.
        let ticket = if marker.is_xid() {
            *self.prepared.lock() += 1;
            self.group_commit.order_for_group_commit(ordering_required)
        } else {
            None
        };

        let sync = match self.sync_locked(&mut state, ticket.is_some()) {
            Ok(sync) => sync,
            Err(err) => {
                if marker.is_xid() {
                    self.release_prepared();
                }
                if ticket.is_some() {
                    self.group_commit
                        .disable("log sync failed while a commit ticket was held");
                }
                return Err(err);
            }
        };

        let log_full = state.position() >= self.config.max_file_size;
        let mut rotated = false;
        if log_full && !marker.is_xid() {
            // A failed rotation disables the writer and is logged there;
            // this transaction is already durable.
            rotated = self.new_file_locked(&mut state, true).unwrap_or(false);
        }
        drop(state);
        if rotated {
            self.expire_logs();
        }

        Ok(WriteReceipt {
            ticket,
            sync,
            bytes: buf.len() as u64,
            log_full: log_full && marker.is_xid(),
        })
    }

    /// Appends a standalone incident record and syncs it
    pub fn write_incident(&self, message: &str) -> LogResult<()> {
        let mut state = self.state.lock();
        state.check_status()?;
        let record = RecordBody::lost_events(message).encode(
            self.config.server_id,
            0,
            state.position(),
        );
        self.append_locked(&mut state, &record)?;
        self.metrics.increment_log_incidents();
        self.sync_locked(&mut state, false)?;
        Ok(())
    }

    fn append_locked(&self, state: &mut FileState, buf: &[u8]) -> LogResult<()> {
        let active = state.active.as_mut().ok_or_else(LogError::not_open)?;
        maybe_crash(points::LOG_BEFORE_WRITE);
        match active.file.write_all(buf) {
            Ok(()) => {
                active.position += buf.len() as u64;
                maybe_crash(points::LOG_AFTER_WRITE);
                self.metrics.add_log_bytes(buf.len() as u64);
                Ok(())
            }
            Err(e) => {
                let err = LogError::write_failed(format!("Failed to append to {}", active.name), e);
                self.disable(state, err.to_string());
                Err(err)
            }
        }
    }

    /// Syncs the active file according to the sync period and group commit
    fn sync_locked(
        &self,
        state: &mut MutexGuard<'_, FileState>,
        ordered: bool,
    ) -> LogResult<SyncOutcome> {
        if self.config.sync_period == 0 {
            return Ok(SyncOutcome::Skipped);
        }
        state.writes_since_sync += 1;
        if state.writes_since_sync < self.config.sync_period {
            return Ok(SyncOutcome::Skipped);
        }
        state.writes_since_sync = 0;

        let pending = self.in_flight.load(Ordering::Acquire);
        let result = self.group_commit.sync_batched(state, pending, ordered, |st| {
            maybe_crash(points::LOG_BEFORE_FSYNC);
            let synced = match st.active.as_ref() {
                Some(active) => active.file.sync_data(),
                None => Ok(()),
            };
            maybe_crash(points::LOG_AFTER_FSYNC);
            synced
        });
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let name = state.active.as_ref().map_or("<none>", |a| a.name.as_str());
                let err = LogError::fsync_failed(format!("fsync of {} failed", name), e);
                self.disable(state, err.to_string());
                Err(err)
            }
        }
    }

    fn disable(&self, state: &mut FileState, reason: String) {
        if state.status != WriterStatus::Operational {
            return;
        }
        log_event(Event::LogDisabled, &[("reason", &reason)]);
        state.status = WriterStatus::Disabled(reason);
        self.drain_cond.notify_all();
    }

    // ==================== Prepared XIDs ====================

    /// XIDs written through this writer and not yet released
    pub fn prepared_count(&self) -> u64 {
        *self.prepared.lock()
    }

    /// Releases one prepared XID; wakes a draining rotation at zero
    pub fn release_prepared(&self) {
        let mut prepared = self.prepared.lock();
        *prepared = prepared.saturating_sub(1);
        if *prepared == 0 {
            self.prepared_cond.notify_all();
        }
    }

    /// Blocks until every prepared XID has been released
    pub fn wait_for_prepared(&self) {
        let mut prepared = self.prepared.lock();
        while *prepared > 0 {
            self.prepared_cond.wait(&mut prepared);
        }
    }

    // ==================== Rotation ====================

    /// Closes the active file and starts the next one.
    ///
    /// Waits for every prepared XID to be released first. XID writes
    /// arriving meanwhile block until the new file is active.
    pub fn rotate(&self) -> LogResult<()> {
        let mut state = self.state.lock();
        self.new_file_locked(&mut state, false)?;
        drop(state);
        self.expire_logs();
        Ok(())
    }

    /// Rotates if `force` is set or the active file is full, then expires
    /// old files. Returns whether a rotation happened.
    pub fn rotate_and_purge(&self, force: bool) -> LogResult<bool> {
        let mut state = self.state.lock();
        let rotated = self.new_file_locked(&mut state, !force)?;
        drop(state);
        if rotated {
            self.expire_logs();
        }
        Ok(rotated)
    }

    fn new_file_locked(
        &self,
        state: &mut MutexGuard<'_, FileState>,
        only_if_full: bool,
    ) -> LogResult<bool> {
        while state.draining {
            self.drain_cond.wait(state);
        }
        state.check_status()?;
        if only_if_full && state.position() < self.config.max_file_size {
            return Ok(false);
        }

        state.draining = true;
        MutexGuard::unlocked(state, || self.wait_for_prepared());
        let result = self.switch_file(state);
        state.draining = false;
        self.drain_cond.notify_all();

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.disable(state, format!("rotation failed: {}", e));
                Err(e)
            }
        }
    }

    fn switch_file(&self, state: &mut FileState) -> LogResult<()> {
        state.check_status()?;
        let mut index = self.index.lock();
        let next = index.next_file_name()?;
        let mut old = state.active.take().ok_or_else(LogError::not_open)?;

        let rotate = RecordBody::Rotate {
            next_file: next.clone(),
            position: LOG_MAGIC.len() as u64,
        }
        .encode(self.config.server_id, 0, old.position);
        old.file.write_all(&rotate).map_err(|e| {
            LogError::write_failed(format!("Failed to write rotate record to {}", old.name), e)
        })?;
        maybe_crash(points::LOG_AFTER_ROTATE_MARKER);
        release_file(&mut old)?;

        let active = create_log_file(&index, &next, self.config.server_id)?;
        index.append(&next)?;
        state.active = Some(active);
        state.writes_since_sync = 0;

        self.metrics.increment_log_rotations();
        log_event(Event::LogRotate, &[("from", &old.name), ("to", &next)]);
        Ok(())
    }

    // ==================== Purge ====================

    /// Deletes indexed files before `to`, oldest first.
    ///
    /// Stops at the active file or the first file a consumer still uses.
    /// Returns the names removed from the index.
    ///
    /// # Errors
    ///
    /// Returns `AERO_LOG_NOT_IN_INDEX` if `to` is not indexed.
    pub fn purge_before(&self, to: &str) -> LogResult<Vec<String>> {
        let consumer = self.consumer.read().clone();
        let mut index = self.index.lock();
        let end = index.position(to).ok_or_else(|| LogError::not_in_index(to))?;
        let active = index.last().map(String::from);

        let candidates: Vec<String> = index.entries()[..end]
            .iter()
            .take_while(|name| !is_protected(name, active.as_deref(), consumer.as_deref()))
            .cloned()
            .collect();
        self.purge_files(&mut index, candidates)
    }

    /// Deletes indexed files last modified before `before`.
    ///
    /// Stops at the first newer file, the active file, or a file in use.
    pub fn purge_older_than(&self, before: DateTime<Utc>) -> LogResult<Vec<String>> {
        let consumer = self.consumer.read().clone();
        let mut index = self.index.lock();
        let active = index.last().map(String::from);

        let mut candidates = Vec::new();
        for name in index.entries() {
            if is_protected(name, active.as_deref(), consumer.as_deref()) {
                break;
            }
            let path = index.file_path(name);
            match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => {
                    if DateTime::<Utc>::from(modified) >= before {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LogError::purge_failed(
                        format!("Failed to stat {}", path.display()),
                        e,
                    ))
                }
            }
            candidates.push(name.clone());
        }
        self.purge_files(&mut index, candidates)
    }

    fn purge_files(&self, index: &mut LogIndex, names: Vec<String>) -> LogResult<Vec<String>> {
        if names.is_empty() {
            return Ok(names);
        }
        index.write_purge_intent(&names)?;
        maybe_crash(points::LOG_AFTER_PURGE_INTENT);
        finish_purge(index, &names, &self.metrics)
    }

    fn expire_logs(&self) {
        if self.config.expire_logs_days == 0 {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.config.expire_logs_days as i64);
        if let Err(e) = self.purge_older_than(cutoff) {
            log_event(Event::LogPurgeSkipped, &[("reason", &e.to_string())]);
        }
    }

    // ==================== Administration ====================

    /// Returns a disabled or closed writer to service with a fresh file.
    ///
    /// A no-op on an operational writer.
    pub fn reopen(&self) -> LogResult<()> {
        let mut state = self.state.lock();
        while state.draining {
            self.drain_cond.wait(&mut state);
        }
        if state.status == WriterStatus::Operational {
            return Ok(());
        }

        if let Some(mut old) = state.active.take() {
            // The old handle failed once already; only try to mark it closed.
            let released = set_in_use_flag(&mut old.file, false).and_then(|_| {
                old.file
                    .sync_all()
                    .map_err(|e| LogError::fsync_failed("Failed to sync released log", e))
            });
            if let Err(e) = released {
                log_event_at(
                    Severity::Warn,
                    Event::LogReopened,
                    &[("stale_file", &old.name), ("release_error", &e.to_string())],
                );
            }
        }

        let mut index = self.index.lock();
        let name = index.next_file_name()?;
        let active = create_log_file(&index, &name, self.config.server_id)?;
        index.append(&name)?;
        state.active = Some(active);
        state.status = WriterStatus::Operational;
        state.writes_since_sync = 0;
        log_event(Event::LogReopened, &[("file", &name)]);
        Ok(())
    }

    /// Deletes every indexed file and starts over with a fresh first file.
    ///
    /// Waits for prepared XIDs like a rotation does.
    pub fn reset_logs(&self) -> LogResult<()> {
        let mut state = self.state.lock();
        while state.draining {
            self.drain_cond.wait(&mut state);
        }
        state.check_status()?;

        state.draining = true;
        MutexGuard::unlocked(&mut state, || self.wait_for_prepared());
        let result = self.reset_files(&mut state);
        state.draining = false;
        self.drain_cond.notify_all();

        if let Err(e) = &result {
            self.disable(&mut state, format!("reset failed: {}", e));
        }
        result
    }

    fn reset_files(&self, state: &mut FileState) -> LogResult<()> {
        let mut index = self.index.lock();
        state.active = None;

        for name in index.entries() {
            let path = index.file_path(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LogError::purge_failed(
                        format!("Failed to delete {}", path.display()),
                        e,
                    ))
                }
            }
        }
        index.remove_purge_intent()?;
        index.clear()?;

        let name = index.next_file_name()?;
        let active = create_log_file(&index, &name, self.config.server_id)?;
        index.append(&name)?;
        state.active = Some(active);
        state.writes_since_sync = 0;
        log_event(Event::LogReset, &[("file", &name)]);
        Ok(())
    }

    /// Writes a stop record, clears the in-use flag and syncs.
    ///
    /// Later writes return `AERO_LOG_NOT_OPEN`. Closing twice is a no-op.
    pub fn close(&self) -> LogResult<()> {
        let mut state = self.state.lock();
        while state.draining {
            self.drain_cond.wait(&mut state);
        }
        if state.status == WriterStatus::Closed {
            return Ok(());
        }

        let result = match state.active.take() {
            Some(mut active) => {
                let stop = RecordBody::Stop.encode(self.config.server_id, 0, active.position);
                active
                    .file
                    .write_all(&stop)
                    .map_err(|e| {
                        LogError::write_failed(format!("Failed to write stop record to {}", active.name), e)
                    })
                    .and_then(|_| release_file(&mut active))
                    .map(|_| active.name)
            }
            None => Ok(String::new()),
        };
        state.status = WriterStatus::Closed;
        self.drain_cond.notify_all();

        let name = result?;
        log_event(Event::LogClose, &[("file", &name)]);
        Ok(())
    }

    /// Swaps the active handle for a read-only one so the next append fails
    #[cfg(test)]
    fn break_active_file(&self) {
        let mut state = self.state.lock();
        let index = self.index.lock();
        if let Some(active) = state.active.as_mut() {
            active.file = File::open(index.file_path(&active.name)).unwrap();
        }
    }
}

/// Creates a log file with magic and an in-use format record, synced
fn create_log_file(index: &LogIndex, name: &str, server_id: u32) -> LogResult<ActiveFile> {
    let path = index.file_path(name);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            LogError::write_failed(format!("Failed to create log file: {}", path.display()), e)
        })?;

    let mut header = LOG_MAGIC.to_vec();
    header.extend(RecordBody::format_description().encode(
        server_id,
        FLAG_IN_USE,
        LOG_MAGIC.len() as u64,
    ));
    file.write_all(&header).map_err(|e| {
        LogError::write_failed(format!("Failed to write log header: {}", path.display()), e)
    })?;
    file.sync_all().map_err(|e| {
        LogError::fsync_failed(format!("Failed to sync new log file: {}", path.display()), e)
    })?;
    sync_dir(index.dir())
        .map_err(|e| LogError::fsync_failed("Failed to sync log directory", e))?;

    Ok(ActiveFile {
        name: name.to_string(),
        file,
        position: header.len() as u64,
    })
}

/// Syncs a finished file and clears its in-use flag
fn release_file(active: &mut ActiveFile) -> LogResult<()> {
    active.file.sync_data().map_err(|e| {
        LogError::fsync_failed(format!("Failed to sync {}", active.name), e)
    })?;
    set_in_use_flag(&mut active.file, false)?;
    active.file.sync_all().map_err(|e| {
        LogError::fsync_failed(format!("Failed to sync {}", active.name), e)
    })
}

fn is_protected(name: &str, active: Option<&str>, consumer: Option<&dyn LogConsumer>) -> bool {
    active == Some(name) || consumer.map_or(false, |c| c.is_file_in_use(name))
}

/// Unlinks the files named by a purge intent, then rewrites the index and
/// drops the intent. Files already gone count as purged.
fn finish_purge(
    index: &mut LogIndex,
    names: &[String],
    metrics: &MetricsRegistry,
) -> LogResult<Vec<String>> {
    let mut purged = Vec::with_capacity(names.len());
    for name in names {
        let path = index.file_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                metrics.increment_log_files_purged();
                purged.push(name.clone());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log_event(
                    Event::LogPurgeSkipped,
                    &[("file", name), ("reason", "already deleted")],
                );
                purged.push(name.clone());
            }
            Err(e) => {
                log_event(
                    Event::LogPurgeSkipped,
                    &[("file", name), ("reason", &e.to_string())],
                );
            }
        }
        maybe_crash(points::LOG_AFTER_UNLINK);
    }
    sync_dir(index.dir()).map_err(|e| LogError::purge_failed("Failed to sync log directory", e))?;

    maybe_crash(points::LOG_BEFORE_INDEX_REWRITE);
    index.remove(&purged)?;
    index.remove_purge_intent()?;
    log_event(Event::LogPurge, &[("files", &purged.join(","))]);
    Ok(purged)
}

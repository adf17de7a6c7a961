//! Group commit: ticket ordering and fsync batching
//!
//! Two independent jobs share this coordinator:
//!
//! 1. Commit ordering. A committer that must reach its engines in log order
//!    takes a ticket while it still holds the log file lock, so ticket order
//!    is XID append order. After the log write it waits for its turn,
//!    commits in its engines and advances the ticket. Each ticket is
//!    advanced exactly once.
//! 2. Fsync batching. When enough committers are in flight, a committer
//!    waits briefly on the file lock's condition variable; whoever wakes
//!    first without a newer sync does one fsync for everyone, the rest
//!    learn their data is already synced.
//!
//! Anything that breaks the ticket protocol (overflow, out-of-order
//! advance, a wait longer than the hang ceiling) disables group commit for
//! the rest of the process. Commits then proceed unordered with one fsync
//! each instead of hanging.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::observability::{log_event, Event, MetricsRegistry};

/// Number of condition variables tickets are spread over
const TURN_SLOTS: usize = 8;

/// Longest single sleep while waiting for a ticket turn
const TURN_WAKE: Duration = Duration::from_secs(1);

/// Configuration for group commit.
///
/// Disabled by default: each commit performs its own fsync and engines
/// commit in whatever order their threads get there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCommitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Committers in flight before a commit waits to share an fsync
    #[serde(default = "default_min_size")]
    pub min_size: u32,

    /// How long a committer waits for others before syncing itself
    #[serde(default = "default_timeout_usecs")]
    pub timeout_usecs: u64,

    /// Log a diagnostic once a ticket wait exceeds this
    #[serde(default = "default_hang_log_ms")]
    pub hang_log_ms: u64,

    /// Disable group commit once a ticket wait exceeds this
    #[serde(default = "default_hang_disable_ms")]
    pub hang_disable_ms: u64,
}

fn default_min_size() -> u32 {
    4
}
fn default_timeout_usecs() -> u64 {
    1000
}
fn default_hang_log_ms() -> u64 {
    2_000
}
fn default_hang_disable_ms() -> u64 {
    60_000
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: default_min_size(),
            timeout_usecs: default_timeout_usecs(),
            hang_log_ms: default_hang_log_ms(),
            hang_disable_ms: default_hang_disable_ms(),
        }
    }
}

impl GroupCommitConfig {
    /// Create config with group commit enabled.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Create config with group commit disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_size == 0 {
            return Err("min_size must be at least 1".to_string());
        }
        if self.hang_disable_ms < self.hang_log_ms {
            return Err(format!(
                "hang_disable_ms ({}) is below hang_log_ms ({})",
                self.hang_disable_ms, self.hang_log_ms
            ));
        }
        Ok(())
    }
}

/// Position of one committer in the engine commit order.
///
/// Not `Clone`: a ticket is handed back exactly once through
/// [`GroupCommitCoordinator::advance_and_signal`].
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// How a commit's data became durable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The committer synced on its own
    Individual,
    /// The committer synced on behalf of a batch
    Leader,
    /// Another committer's sync already covered this data
    AlreadySynced,
    /// The sync period skipped this write
    Skipped,
}

#[derive(Debug)]
struct TicketState {
    /// Next ticket to hand out
    next: u64,
    /// Ticket whose holder may commit now
    current: u64,
}

/// Coordinates commit order and shared fsyncs
pub struct GroupCommitCoordinator {
    config: GroupCommitConfig,
    failed: AtomicBool,
    tickets: Mutex<TicketState>,
    turns: [Condvar; TURN_SLOTS],
    /// Waited on with the log file lock held
    sync_cond: Condvar,
    fsync_count: AtomicU64,
    waiting: AtomicU32,
    metrics: Arc<MetricsRegistry>,
}

impl GroupCommitCoordinator {
    pub fn new(config: GroupCommitConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            failed: AtomicBool::new(false),
            tickets: Mutex::new(TicketState {
                next: 1,
                current: 1,
            }),
            turns: Default::default(),
            sync_cond: Condvar::new(),
            fsync_count: AtomicU64::new(0),
            waiting: AtomicU32::new(0),
            metrics,
        }
    }

    pub fn config(&self) -> &GroupCommitConfig {
        &self.config
    }

    /// True while group commit is configured on and has not failed
    pub fn is_active(&self) -> bool {
        self.config.enabled && !self.failed.load(Ordering::Acquire)
    }

    /// Number of fsyncs issued through this coordinator
    pub fn fsync_count(&self) -> u64 {
        self.fsync_count.load(Ordering::Acquire)
    }

    /// Turns group commit off for the rest of the process
    pub fn disable(&self, reason: &str) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.metrics.increment_group_commit_disables();
        log_event(Event::GroupCommitDisabled, &[("reason", reason)]);
        for turn in &self.turns {
            turn.notify_all();
        }
        self.sync_cond.notify_all();
    }

    /// Hands out the next ticket.
    ///
    /// Returns `None` when group commit is off or has failed, or when the
    /// caller's engines do not need ordered commit. Must be called with the
    /// log file lock held so ticket order matches append order.
    pub fn order_for_group_commit(&self, ordering_required: bool) -> Option<Ticket> {
        if !ordering_required || !self.is_active() {
            return None;
        }
        let mut state = self.tickets.lock();
        if state.next == u64::MAX {
            drop(state);
            self.disable("commit ticket counter would overflow");
            return None;
        }
        let ticket = Ticket(state.next);
        state.next += 1;
        Some(ticket)
    }

    /// Blocks until `ticket` is the current ticket.
    ///
    /// Wakes periodically to report a long wait, and gives up by disabling
    /// group commit once the wait passes the hang ceiling.
    pub fn wait_for_turn(&self, ticket: &Ticket) {
        let hang_log = Duration::from_millis(self.config.hang_log_ms);
        let hang_disable = Duration::from_millis(self.config.hang_disable_ms);
        let slice = TURN_WAKE.min(hang_log).min(hang_disable).max(Duration::from_millis(1));
        let turn = &self.turns[ticket.0 as usize % TURN_SLOTS];

        let start = Instant::now();
        let mut waited = false;
        let mut reported = false;
        let mut state = self.tickets.lock();
        while state.current != ticket.0 {
            if !self.is_active() {
                return;
            }
            waited = true;
            turn.wait_for(&mut state, slice);

            let elapsed = start.elapsed();
            if elapsed >= hang_disable && state.current != ticket.0 {
                drop(state);
                self.disable(&format!(
                    "ticket {} waited {} ms for its turn",
                    ticket.0,
                    elapsed.as_millis()
                ));
                return;
            }
            if !reported && elapsed >= hang_log {
                reported = true;
                self.metrics.increment_ticket_long_waits();
                log_event(
                    Event::GroupCommitLongWait,
                    &[
                        ("ticket", &ticket.0.to_string()),
                        ("current", &state.current.to_string()),
                        ("waited_ms", &elapsed.as_millis().to_string()),
                    ],
                );
            }
        }
        if waited {
            self.metrics.increment_ticket_waits();
        }
    }

    /// Passes the turn to the next ticket and wakes only its slot.
    ///
    /// An out-of-order ticket disables group commit.
    pub fn advance_and_signal(&self, ticket: Ticket) {
        let mut state = self.tickets.lock();
        if state.current != ticket.0 {
            let current = state.current;
            drop(state);
            if self.is_active() {
                self.disable(&format!(
                    "ticket {} advanced while ticket {} was current",
                    ticket.0, current
                ));
            }
            return;
        }
        state.current += 1;
        self.turns[state.current as usize % TURN_SLOTS].notify_all();
    }

    /// Makes the caller's data durable, sharing the fsync when worthwhile.
    ///
    /// `guard` is the log file lock; it is released while waiting for other
    /// committers and re-acquired before the sync. `pending` is the number
    /// of committers currently in flight and `ordered` whether the caller
    /// holds a ticket.
    pub fn sync_batched<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        pending: u32,
        ordered: bool,
        mut fsync: F,
    ) -> io::Result<SyncOutcome>
    where
        F: FnMut(&mut T) -> io::Result<()>,
    {
        let enough_pending = ordered && self.is_active() && pending >= self.config.min_size;
        let not_too_many_waiting =
            enough_pending && self.waiting.load(Ordering::Acquire) < pending / 2;

        if enough_pending && not_too_many_waiting {
            let seen = self.fsync_count.load(Ordering::Acquire);
            self.waiting.fetch_add(1, Ordering::AcqRel);
            self.sync_cond
                .wait_for(guard, Duration::from_micros(self.config.timeout_usecs));
            self.waiting.fetch_sub(1, Ordering::AcqRel);

            if self.fsync_count.load(Ordering::Acquire) != seen {
                self.metrics.increment_group_sync_followers();
                return Ok(SyncOutcome::AlreadySynced);
            }
            fsync(&mut **guard)?;
            self.fsync_count.fetch_add(1, Ordering::AcqRel);
            self.metrics.increment_fsync_count();
            self.metrics.increment_group_sync_leaders();
            self.sync_cond.notify_all();
            return Ok(SyncOutcome::Leader);
        }

        fsync(&mut **guard)?;
        self.fsync_count.fetch_add(1, Ordering::AcqRel);
        self.metrics.increment_fsync_count();
        self.metrics.increment_individual_syncs();
        if ordered {
            self.sync_cond.notify_all();
        }
        Ok(SyncOutcome::Individual)
    }

    #[cfg(test)]
    fn set_ticket_counters(&self, value: u64) {
        let mut state = self.tickets.lock();
        state.next = value;
        state.current = value;
    }
}

//! Page state machine of the mmap commit log
//!
//! Every page moves through
//!
//! ```text
//!   Pool --Activate--> Active --SlotWritten--> Dirty --SyncStarted--> Syncing
//!    ^                   |  ^                   |  ^                     |
//!    |                   |  +------SlotFreed----+  +-----SlotWritten-----+
//!    +----SyncFinished---+-------------------------------------(ok or not)
//! ```
//!
//! The functions here are pure: they decide, the mmap log acts. Each page's
//! control block lives behind its own lock.

use std::fmt;

/// Lifecycle of one commit-log page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Available for activation
    Pool,
    /// Receiving xids, nothing unsynced yet
    Active,
    /// Holds xids that are not yet synced
    Dirty,
    /// A thread is syncing the page
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    Activate,
    SlotWritten,
    SyncStarted,
    SyncFinished { ok: bool },
    SlotFreed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub state: PageState,
    pub event: PageEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page event {:?} is invalid in state {:?}", self.event, self.state)
    }
}

/// Next state of a page after `event`.
///
/// Freeing a slot never changes the state. A finished sync always returns
/// the page to the pool; a failed sync is reported to waiters through the
/// page's error generation, not through its state.
pub fn transition(state: PageState, event: PageEvent) -> Result<PageState, InvalidTransition> {
    use PageEvent::*;
    use PageState::*;

    match (state, event) {
        (Pool, Activate) => Ok(Active),
        (Active | Dirty | Syncing, SlotWritten) => Ok(if state == Syncing { Syncing } else { Dirty }),
        (Dirty, SyncStarted) => Ok(Syncing),
        (Syncing, SyncFinished { .. }) => Ok(Pool),
        (_, SlotFreed) => Ok(state),
        _ => Err(InvalidTransition { state, event }),
    }
}

/// Mutable control block of one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCtl {
    pub state: PageState,
    /// Threads blocked until this page is synced
    pub waiters: u32,
    /// Number of completed syncs; a slot written after sync `n` is durable
    /// once `synced_gen > n`
    pub synced_gen: u64,
    /// Generation of the last failed sync
    pub error_gen: Option<u64>,
    /// Free slots
    pub free: usize,
    /// Total slots
    pub size: usize,
    /// No free slot lies below this index
    pub hint: usize,
}

impl PageCtl {
    pub fn new(size: usize) -> Self {
        Self {
            state: PageState::Pool,
            waiters: 0,
            synced_gen: 0,
            error_gen: None,
            free: size,
            size,
            hint: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.free == 0
    }

    /// Applies `event`, leaving the page untouched if it is invalid
    pub fn apply(&mut self, event: PageEvent) -> Result<(), InvalidTransition> {
        self.state = transition(self.state, event)?;
        if let PageEvent::SyncFinished { ok } = event {
            self.synced_gen += 1;
            if !ok {
                self.error_gen = Some(self.synced_gen);
            }
        }
        Ok(())
    }
}

/// What a thread that wrote into a page during generation `my_gen` does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// The sync covering the slot finished; `failed` if it reported an error
    Done { failed: bool },
    /// Someone else is syncing, or the single sync slot is busy
    Wait,
    /// Sync the page itself
    BecomeSyncer,
}

/// `my_gen` is `synced_gen + 1` as observed when the slot was written.
pub fn waiter_decision(ctl: &PageCtl, my_gen: u64, sync_slot_free: bool) -> WaitDecision {
    if ctl.synced_gen >= my_gen {
        let failed = matches!(ctl.error_gen, Some(g) if g >= my_gen);
        return WaitDecision::Done { failed };
    }
    match ctl.state {
        PageState::Syncing => WaitDecision::Wait,
        PageState::Dirty if sync_slot_free => WaitDecision::BecomeSyncer,
        _ => WaitDecision::Wait,
    }
}

/// Picks the pool page to activate next.
///
/// `pool` lists `(waiters, free)` per pooled page, head first. The head
/// wins if nobody waits on it and it has room; otherwise the page with no
/// waiters and the most free slots. `None` means every pooled page is full
/// or still watched by waiters.
pub fn choose_pool_page(pool: &[(u32, usize)]) -> Option<usize> {
    match pool.first() {
        Some(&(0, free)) if free > 0 => return Some(0),
        None => return None,
        _ => {}
    }
    pool.iter()
        .enumerate()
        .filter(|(_, &(waiters, free))| waiters == 0 && free > 0)
        .max_by_key(|(i, &(_, free))| (free, std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Transition Tests ====================

    #[test]
    fn test_full_cycle() {
        let mut ctl = PageCtl::new(4);
        ctl.apply(PageEvent::Activate).unwrap();
        assert_eq!(ctl.state, PageState::Active);
        ctl.apply(PageEvent::SlotWritten).unwrap();
        assert_eq!(ctl.state, PageState::Dirty);
        ctl.apply(PageEvent::SyncStarted).unwrap();
        ctl.apply(PageEvent::SlotWritten).unwrap();
        assert_eq!(ctl.state, PageState::Syncing);
        ctl.apply(PageEvent::SyncFinished { ok: true }).unwrap();
        assert_eq!(ctl.state, PageState::Pool);
        assert_eq!(ctl.synced_gen, 1);
        assert_eq!(ctl.error_gen, None);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(transition(PageState::Pool, PageEvent::SlotWritten).is_err());
        assert!(transition(PageState::Active, PageEvent::SyncStarted).is_err());
        assert!(transition(PageState::Dirty, PageEvent::Activate).is_err());
        assert!(transition(PageState::Active, PageEvent::SyncFinished { ok: true }).is_err());

        let mut ctl = PageCtl::new(2);
        let err = ctl.apply(PageEvent::SyncStarted).unwrap_err();
        assert_eq!(err.state, PageState::Pool);
        assert_eq!(ctl.state, PageState::Pool);
    }

    #[test]
    fn test_slot_freed_keeps_state() {
        for state in [PageState::Pool, PageState::Active, PageState::Dirty, PageState::Syncing] {
            assert_eq!(transition(state, PageEvent::SlotFreed), Ok(state));
        }
    }

    #[test]
    fn test_failed_sync_sets_error_generation() {
        let mut ctl = PageCtl::new(2);
        ctl.apply(PageEvent::Activate).unwrap();
        ctl.apply(PageEvent::SlotWritten).unwrap();
        ctl.apply(PageEvent::SyncStarted).unwrap();
        ctl.apply(PageEvent::SyncFinished { ok: false }).unwrap();
        assert_eq!(ctl.state, PageState::Pool);
        assert_eq!(ctl.error_gen, Some(1));
    }

    // ==================== Waiter Tests ====================

    #[test]
    fn test_waiter_decisions() {
        let mut ctl = PageCtl::new(4);
        ctl.apply(PageEvent::Activate).unwrap();
        ctl.apply(PageEvent::SlotWritten).unwrap();
        let my_gen = ctl.synced_gen + 1;

        assert_eq!(waiter_decision(&ctl, my_gen, true), WaitDecision::BecomeSyncer);
        assert_eq!(waiter_decision(&ctl, my_gen, false), WaitDecision::Wait);

        ctl.apply(PageEvent::SyncStarted).unwrap();
        assert_eq!(waiter_decision(&ctl, my_gen, true), WaitDecision::Wait);

        ctl.apply(PageEvent::SyncFinished { ok: true }).unwrap();
        assert_eq!(waiter_decision(&ctl, my_gen, true), WaitDecision::Done { failed: false });
    }

    #[test]
    fn test_error_reaches_only_covered_writers() {
        let mut ctl = PageCtl::new(4);
        ctl.apply(PageEvent::Activate).unwrap();
        ctl.apply(PageEvent::SlotWritten).unwrap();
        ctl.apply(PageEvent::SyncStarted).unwrap();
        ctl.apply(PageEvent::SyncFinished { ok: false }).unwrap();
        assert_eq!(waiter_decision(&ctl, 1, false), WaitDecision::Done { failed: true });

        ctl.apply(PageEvent::Activate).unwrap();
        ctl.apply(PageEvent::SlotWritten).unwrap();
        ctl.apply(PageEvent::SyncStarted).unwrap();
        ctl.apply(PageEvent::SyncFinished { ok: true }).unwrap();
        assert_eq!(waiter_decision(&ctl, 2, false), WaitDecision::Done { failed: false });
    }

    // ==================== Pool Selection Tests ====================

    #[test]
    fn test_head_preferred_when_unwatched() {
        assert_eq!(choose_pool_page(&[(0, 1), (0, 10)]), Some(0));
    }

    #[test]
    fn test_skips_watched_and_full_pages() {
        assert_eq!(choose_pool_page(&[(2, 10), (0, 3), (0, 7), (1, 9)]), Some(2));
        assert_eq!(choose_pool_page(&[(0, 0), (0, 4)]), Some(1));
        assert_eq!(choose_pool_page(&[(1, 5), (0, 0)]), None);
        assert_eq!(choose_pool_page(&[]), None);
    }

    #[test]
    fn test_ties_go_to_earliest() {
        assert_eq!(choose_pool_page(&[(1, 5), (0, 4), (0, 4)]), Some(1));
    }
}

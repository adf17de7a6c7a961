//! Two-phase commit driver
//!
//! ```text
//! prepare all engines -> log_xid -> wait for ticket turn
//!     -> commit all engines -> advance ticket -> unlog
//! ```
//!
//! Before `log_xid` returns, a crash rolls the transaction back in every
//! engine. After it returns, a crash commits it. A failed prepare or
//! failed `log_xid` rolls every engine back immediately.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::observability::{log_event, Event};
use crate::session::Session;

use super::engine::EngineSet;
use super::errors::{TcError, TcResult};
use super::{CommitLog, Xid};

pub struct TransactionCoordinator {
    engines: EngineSet,
    tc: Arc<dyn CommitLog>,
}

impl TransactionCoordinator {
    pub fn new(engines: EngineSet, tc: Arc<dyn CommitLog>) -> Self {
        Self { engines, tc }
    }

    pub fn engines(&self) -> &EngineSet {
        &self.engines
    }

    pub fn commit_log(&self) -> &Arc<dyn CommitLog> {
        &self.tc
    }

    /// Commits `xid` in every engine.
    ///
    /// With the log-backed commit log the session's cache is written as
    /// part of `log_xid`. Engines that need log order see their commits in
    /// the order the XID records were appended.
    ///
    /// # Errors
    ///
    /// - `AERO_TC_ENGINE` if an engine fails to prepare (the transaction is
    ///   rolled back) or to commit (the decision stands)
    /// - any `log_xid` error, after rolling the transaction back
    pub fn commit(&self, session: &mut Session, xid: Xid) -> TcResult<()> {
        session.set_ordering_required(self.engines.is_ordered_commit());

        if let Err(e) = self.engines.prepare_all(xid) {
            self.rollback_after_failure(xid, "prepare", &e.to_string());
            return Err(TcError::engine(e));
        }

        let cookie = match self.tc.log_xid(session, xid) {
            Ok(cookie) => cookie,
            Err(e) => {
                self.rollback_after_failure(xid, "log_xid", &e.to_string());
                return Err(e);
            }
        };

        let ticket = session.take_ticket();
        let group_commit = self.tc.group_commit();
        if let (Some(gc), Some(ticket)) = (group_commit, ticket.as_ref()) {
            gc.wait_for_turn(ticket);
        }
        let committed = self.engines.commit_all(xid);
        if let (Some(gc), Some(ticket)) = (group_commit, ticket) {
            gc.advance_and_signal(ticket);
        }

        self.tc.unlog(cookie, xid)?;
        committed.map_err(|e| {
            log_event(
                Event::CommitFailed,
                &[("xid", &xid.to_string()), ("stage", "commit"), ("error", &e.to_string())],
            );
            TcError::engine(e)
        })
    }

    /// Rolls `xid` back in every engine
    pub fn rollback(&self, xid: Xid) -> TcResult<()> {
        self.engines.rollback_all(xid).map_err(TcError::engine)
    }

    /// Xids the commit log still holds
    pub fn recover(&self) -> TcResult<BTreeSet<Xid>> {
        self.tc.recover()
    }

    fn rollback_after_failure(&self, xid: Xid, stage: &str, reason: &str) {
        log_event(
            Event::CommitFailed,
            &[("xid", &xid.to_string()), ("stage", stage), ("error", reason)],
        );
        if let Err(e) = self.engines.rollback_all(xid) {
            log_event(
                Event::CommitFailed,
                &[("xid", &xid.to_string()), ("stage", "rollback"), ("error", &e.to_string())],
            );
        }
    }
}

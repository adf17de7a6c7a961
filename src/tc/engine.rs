//! Storage engine participants of two-phase commit
//!
//! Engines are reached only through [`StorageEngine`]. An [`EngineSet`] is
//! the fixed list of participants, registered once at startup; its length
//! is what the mmap commit log records as the engine count.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::Xid;

/// Failures reported by a storage engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine {engine} failed to prepare xid {xid}: {reason}")]
    Prepare {
        engine: String,
        xid: Xid,
        reason: String,
    },

    #[error("engine {engine} failed to commit xid {xid}: {reason}")]
    Commit {
        engine: String,
        xid: Xid,
        reason: String,
    },

    #[error("engine {engine} failed to roll back xid {xid}: {reason}")]
    Rollback {
        engine: String,
        xid: Xid,
        reason: String,
    },

    #[error("engine {engine} failed to recover: {reason}")]
    Recover { engine: String, reason: String },
}

/// Final outcome of a prepared transaction found during recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Committed,
    RolledBack,
}

/// A prepared transaction an engine resolved during recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredTxn {
    pub xid: Xid,
    pub resolution: Resolution,
}

/// A transactional storage engine.
///
/// `recover` is handed the xids the commit log knows to be committed. The
/// engine commits its prepared transactions in that set, rolls back the
/// rest, and reports what it did.
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &str;

    fn prepare(&self, xid: Xid) -> Result<(), EngineError>;

    fn commit(&self, xid: Xid) -> Result<(), EngineError>;

    fn rollback(&self, xid: Xid) -> Result<(), EngineError>;

    fn recover(&self, committed: &BTreeSet<Xid>) -> Result<Vec<RecoveredTxn>, EngineError>;

    /// True if this engine must see commits in log order
    fn is_ordered_commit(&self) -> bool {
        false
    }
}

/// What one engine did during recovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineRecovery {
    pub engine: String,
    pub committed: Vec<Xid>,
    pub rolled_back: Vec<Xid>,
}

/// Outcome of crash recovery across all engines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Xids the commit log found committed
    pub committed: BTreeSet<Xid>,
    pub engines: Vec<EngineRecovery>,
}

impl RecoveryReport {
    /// Xids resolved by any engine, either way
    pub fn resolved(&self) -> BTreeSet<Xid> {
        self.engines
            .iter()
            .flat_map(|e| e.committed.iter().chain(e.rolled_back.iter()))
            .copied()
            .collect()
    }
}

/// The registered engines, in registration order
#[derive(Clone, Default)]
pub struct EngineSet {
    engines: Vec<Arc<dyn StorageEngine>>,
}

impl EngineSet {
    pub fn new(engines: Vec<Arc<dyn StorageEngine>>) -> Self {
        Self { engines }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn StorageEngine>> {
        self.engines.iter()
    }

    /// True if any engine needs commits in log order
    pub fn is_ordered_commit(&self) -> bool {
        self.engines.iter().any(|e| e.is_ordered_commit())
    }

    /// Prepares `xid` in every engine, stopping at the first failure
    pub fn prepare_all(&self, xid: Xid) -> Result<(), EngineError> {
        self.engines.iter().try_for_each(|e| e.prepare(xid))
    }

    /// Commits `xid` in every engine.
    ///
    /// Every engine is attempted; the first failure is returned.
    pub fn commit_all(&self, xid: Xid) -> Result<(), EngineError> {
        first_error(self.engines.iter().map(|e| e.commit(xid)))
    }

    /// Rolls `xid` back in every engine.
    ///
    /// Every engine is attempted; the first failure is returned.
    pub fn rollback_all(&self, xid: Xid) -> Result<(), EngineError> {
        first_error(self.engines.iter().map(|e| e.rollback(xid)))
    }

    /// Lets every engine resolve its prepared transactions against `committed`
    pub fn recover(&self, committed: &BTreeSet<Xid>) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport {
            committed: committed.clone(),
            engines: Vec::with_capacity(self.engines.len()),
        };
        for engine in &self.engines {
            let mut outcome = EngineRecovery {
                engine: engine.name().to_string(),
                ..EngineRecovery::default()
            };
            for txn in engine.recover(committed)? {
                match txn.resolution {
                    Resolution::Committed => outcome.committed.push(txn.xid),
                    Resolution::RolledBack => outcome.rolled_back.push(txn.xid),
                }
            }
            report.engines.push(outcome);
        }
        Ok(report)
    }
}

fn first_error(results: impl Iterator<Item = Result<(), EngineError>>) -> Result<(), EngineError> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeEngine {
        name: &'static str,
        fail_prepare: bool,
        fail_commit: bool,
        calls: Mutex<Vec<String>>,
        prepared: Mutex<BTreeSet<Xid>>,
    }

    impl FakeEngine {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Self::default()
            }
        }
    }

    impl StorageEngine for FakeEngine {
        fn name(&self) -> &str {
            self.name
        }

        fn prepare(&self, xid: Xid) -> Result<(), EngineError> {
            self.calls.lock().push(format!("prepare {}", xid));
            if self.fail_prepare {
                return Err(EngineError::Prepare {
                    engine: self.name.to_string(),
                    xid,
                    reason: "injected".to_string(),
                });
            }
            self.prepared.lock().insert(xid);
            Ok(())
        }

        fn commit(&self, xid: Xid) -> Result<(), EngineError> {
            self.calls.lock().push(format!("commit {}", xid));
            if self.fail_commit {
                return Err(EngineError::Commit {
                    engine: self.name.to_string(),
                    xid,
                    reason: "injected".to_string(),
                });
            }
            Ok(())
        }

        fn rollback(&self, xid: Xid) -> Result<(), EngineError> {
            self.calls.lock().push(format!("rollback {}", xid));
            Ok(())
        }

        fn recover(&self, committed: &BTreeSet<Xid>) -> Result<Vec<RecoveredTxn>, EngineError> {
            let prepared = std::mem::take(&mut *self.prepared.lock());
            Ok(prepared
                .into_iter()
                .map(|xid| RecoveredTxn {
                    xid,
                    resolution: if committed.contains(&xid) {
                        Resolution::Committed
                    } else {
                        Resolution::RolledBack
                    },
                })
                .collect())
        }
    }

    // ==================== Two-Phase Tests ====================

    #[test]
    fn test_prepare_stops_at_first_failure() {
        let a = Arc::new(FakeEngine {
            fail_prepare: true,
            ..FakeEngine::named("a")
        });
        let b = Arc::new(FakeEngine::named("b"));
        let set = EngineSet::new(vec![a.clone(), b.clone()]);

        assert!(matches!(set.prepare_all(9), Err(EngineError::Prepare { xid: 9, .. })));
        assert_eq!(*a.calls.lock(), vec!["prepare 9"]);
        assert!(b.calls.lock().is_empty());
    }

    #[test]
    fn test_commit_tries_every_engine() {
        let a = Arc::new(FakeEngine {
            fail_commit: true,
            ..FakeEngine::named("a")
        });
        let b = Arc::new(FakeEngine::named("b"));
        let set = EngineSet::new(vec![a.clone(), b.clone()]);

        let err = set.commit_all(4).unwrap_err();
        assert!(err.to_string().contains("engine a"));
        assert_eq!(*b.calls.lock(), vec!["commit 4"]);
    }

    #[test]
    fn test_ordered_commit_is_any() {
        struct Ordered;
        impl StorageEngine for Ordered {
            fn name(&self) -> &str {
                "ordered"
            }
            fn prepare(&self, _: Xid) -> Result<(), EngineError> {
                Ok(())
            }
            fn commit(&self, _: Xid) -> Result<(), EngineError> {
                Ok(())
            }
            fn rollback(&self, _: Xid) -> Result<(), EngineError> {
                Ok(())
            }
            fn recover(&self, _: &BTreeSet<Xid>) -> Result<Vec<RecoveredTxn>, EngineError> {
                Ok(Vec::new())
            }
            fn is_ordered_commit(&self) -> bool {
                true
            }
        }

        let plain = EngineSet::new(vec![Arc::new(FakeEngine::named("a"))]);
        assert!(!plain.is_ordered_commit());
        let mixed = EngineSet::new(vec![Arc::new(FakeEngine::named("a")), Arc::new(Ordered)]);
        assert!(mixed.is_ordered_commit());
        assert_eq!(mixed.len(), 2);
    }

    // ==================== Recovery Tests ====================

    #[test]
    fn test_recover_aggregates_outcomes() {
        let a = Arc::new(FakeEngine::named("a"));
        let b = Arc::new(FakeEngine::named("b"));
        a.prepare(1).unwrap();
        a.prepare(2).unwrap();
        b.prepare(2).unwrap();
        let set = EngineSet::new(vec![a, b]);

        let committed: BTreeSet<Xid> = [2].into_iter().collect();
        let report = set.recover(&committed).unwrap();
        assert_eq!(report.engines[0].committed, vec![2]);
        assert_eq!(report.engines[0].rolled_back, vec![1]);
        assert_eq!(report.engines[1].committed, vec![2]);
        assert_eq!(report.resolved(), [1, 2].into_iter().collect());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["engines"][1]["engine"], "b");
    }

    #[test]
    fn test_empty_set() {
        let set = EngineSet::default();
        assert!(set.is_empty());
        set.prepare_all(1).unwrap();
        set.commit_all(1).unwrap();
        let report = set.recover(&BTreeSet::new()).unwrap();
        assert!(report.engines.is_empty());
    }
}

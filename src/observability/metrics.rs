//! Counters for the commit path
//!
//! Monotonic `AtomicU64` counters with relaxed ordering. A registry is
//! created once and shared as `Arc<MetricsRegistry>` by the writer, the
//! group-commit coordinator and the commit log.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($( $(#[$doc:meta])* $name:ident => $inc:ident ),* $(,)?) => {
        /// Registry of commit-path counters
        #[derive(Debug, Default)]
        pub struct MetricsRegistry {
            $( $(#[$doc])* $name: AtomicU64, )*
        }

        /// Point-in-time copy of every counter
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct MetricsSnapshot {
            $( pub $name: u64, )*
        }

        impl MetricsRegistry {
            $(
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

counters! {
    /// Bytes appended to log files
    log_bytes_written => increment_log_bytes_written,
    /// Transactions written with BEGIN..marker framing
    log_transactions => increment_log_transactions,
    /// Standalone or trailing incident records
    log_incidents => increment_log_incidents,
    log_rotations => increment_log_rotations,
    log_files_purged => increment_log_files_purged,
    /// fsync calls on the active log file
    fsync_count => increment_fsync_count,
    /// Syncs performed by a batch leader for other waiters
    group_sync_leaders => increment_group_sync_leaders,
    /// Commits that found their data already synced by someone else
    group_sync_followers => increment_group_sync_followers,
    /// Commits that synced on their own
    individual_syncs => increment_individual_syncs,
    /// Commits that had to wait for their ticket turn
    ticket_waits => increment_ticket_waits,
    /// Ticket waits that crossed the hang-log threshold
    ticket_long_waits => increment_ticket_long_waits,
    group_commit_disables => increment_group_commit_disables,
    /// Waits for a free commit-log page
    tc_page_waits => increment_tc_page_waits,
    tc_page_syncs => increment_tc_page_syncs,
    tc_xids_logged => increment_tc_xids_logged,
    /// Xids resolved during crash recovery
    recovered_xids => increment_recovered_xids,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` to the log byte counter
    pub fn add_log_bytes(&self, bytes: u64) {
        self.log_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds `count` recovered xids
    pub fn add_recovered_xids(&self, count: u64) {
        self.recovered_xids.fetch_add(count, Ordering::Relaxed);
    }
}

//! Crash point injection for durability tests
//!
//! Setting `AEROLOG_CRASH_POINT` to one of the names in [`points`] makes the
//! process abort the moment execution reaches that point: no cleanup, no
//! unwinding, no destructors.
//!
//! ```bash
//! AEROLOG_CRASH_POINT=log_after_purge_intent aerolog purge --config aerolog.json --to aerolog-bin.000003
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn configured_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("AEROLOG_CRASH_POINT").ok())
        .as_deref()
}

/// True if `AEROLOG_CRASH_POINT` names `name`
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    configured_point() == Some(name)
}

/// Aborts the process if the named crash point is enabled.
///
/// A no-op when `AEROLOG_CRASH_POINT` is unset or names another point.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Log writer
    pub const LOG_BEFORE_WRITE: &str = "log_before_write";
    pub const LOG_AFTER_WRITE: &str = "log_after_write";
    pub const LOG_BEFORE_FSYNC: &str = "log_before_fsync";
    pub const LOG_AFTER_FSYNC: &str = "log_after_fsync";
    pub const LOG_AFTER_ROTATE_MARKER: &str = "log_after_rotate_marker";

    // Purge
    pub const LOG_AFTER_PURGE_INTENT: &str = "log_after_purge_intent";
    pub const LOG_AFTER_UNLINK: &str = "log_after_unlink";
    pub const LOG_BEFORE_INDEX_REWRITE: &str = "log_before_index_rewrite";

    // Commit log
    pub const TC_AFTER_SLOT_WRITE: &str = "tc_after_slot_write";
    pub const TC_BEFORE_SYNC: &str = "tc_before_sync";

    pub fn all() -> &'static [&'static str] {
        &[
            LOG_BEFORE_WRITE,
            LOG_AFTER_WRITE,
            LOG_BEFORE_FSYNC,
            LOG_AFTER_FSYNC,
            LOG_AFTER_ROTATE_MARKER,
            LOG_AFTER_PURGE_INTENT,
            LOG_AFTER_UNLINK,
            LOG_BEFORE_INDEX_REWRITE,
            TC_AFTER_SLOT_WRITE,
            TC_BEFORE_SYNC,
        ]
    }
}

//! aerolog - durable commit path for a multi-engine database server
//!
//! Sessions buffer their changes in a transaction cache. At commit the log
//! writer appends the cache to rotated, indexed log files and batches the
//! fsyncs of concurrent commits. When several storage engines take part in
//! one transaction, a commit log records the two-phase-commit decision so
//! that recovery after a crash can tell every engine the same outcome.

pub mod cli;
pub mod config;
pub mod crash_point;
pub mod observability;
pub mod session;
pub mod tc;
pub mod wal;

//! Crash testing framework
//!
//! - `harness`: running the binary with a crash point
//! - `utils`: directory setup and post-crash checks
//! - `scenarios`: one module per operation under test

pub mod harness;
pub mod scenarios;
pub mod utils;

pub use harness::*;
pub use utils::*;

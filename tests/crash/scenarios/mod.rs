//! Crash scenarios

pub mod purge;
pub mod recover;
pub mod rotate;

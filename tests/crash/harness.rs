//! Subprocess management for crash tests

use std::path::Path;
use std::process::{Command, ExitStatus};

/// Result of one run of the binary
#[derive(Debug)]
pub struct CrashTestResult {
    /// The process died without a normal exit
    pub crashed: bool,
    pub exit_status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `aerolog <args> --config <config>` and aborts at `crash_point`.
///
/// With `None` the command runs to completion.
pub fn run_aerolog(args: &[&str], config: &Path, crash_point: Option<&str>) -> CrashTestResult {
    let mut command = Command::new(env!("CARGO_BIN_EXE_aerolog"));
    command.args(args).arg("--config").arg(config);
    match crash_point {
        Some(point) => {
            command.env("AEROLOG_CRASH_POINT", point);
        }
        None => {
            command.env_remove("AEROLOG_CRASH_POINT");
        }
    }

    match command.output() {
        Ok(output) => CrashTestResult {
            crashed: output.status.code().is_none() || !output.status.success(),
            exit_status: Some(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(e) => CrashTestResult {
            crashed: true,
            exit_status: None,
            stdout: String::new(),
            stderr: format!("Failed to execute: {}", e),
        },
    }
}

/// Runs a command that must succeed and returns its stdout
pub fn run_clean(args: &[&str], config: &Path) -> String {
    let result = run_aerolog(args, config, None);
    assert!(
        !result.crashed,
        "aerolog {:?} failed: {:?}\n{}",
        args, result.exit_status, result.stderr
    );
    result.stdout
}

/// Runs a command that must abort at `crash_point`
pub fn run_crashing(args: &[&str], config: &Path, crash_point: &str) -> CrashTestResult {
    let result = run_aerolog(args, config, Some(crash_point));
    assert!(result.crashed, "aerolog {:?} did not crash at {}", args, crash_point);
    assert!(
        result.stderr.contains(&format!("[CRASH] Triggering crash at point: {}", crash_point)),
        "unexpected stderr: {}",
        result.stderr
    );
    result
}

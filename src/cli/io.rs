//! JSON line output for CLI commands
//!
//! Every command prints one compact JSON object per line.

use std::io::Write;

use serde_json::Value;

use super::errors::CliResult;

/// Writes `value` as one line to `out`
pub fn write_line<W: Write>(out: &mut W, value: &Value) -> CliResult<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

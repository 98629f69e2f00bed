//! External host tools.
//!
//! Every provisioner that shells out goes through [`run`], so a spawn failure
//! and a non-zero exit both surface as [`VmError::Tool`] carrying the tool's
//! own stderr.

use std::ffi::OsStr;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, VmError};

/// Run `program` with `args` to completion and return its stdout.
///
/// `label` names the step for logs only.
pub fn run<I, S>(program: &str, args: I, label: &str) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<S> = args.into_iter().collect();
    debug!(
        program,
        label,
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy()).collect::<Vec<_>>(),
        "running host tool"
    );

    let output = Command::new(program).args(&args).output().map_err(|e| VmError::Tool {
        program: program.to_string(),
        reason: format!("failed to spawn for {label}: {e}"),
    })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = match (stderr.trim(), output.status.code()) {
        ("", Some(code)) => format!("exit {code} during {label}"),
        ("", None) => format!("terminated by signal during {label}"),
        (text, _) => text.to_string(),
    };
    Err(VmError::Tool { program: program.to_string(), reason })
}

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, StackjoinError};

/// Captured output of a finished command
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Limit for store and service-manager commands
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `program` with `args`, killing it after [`COMMAND_TIMEOUT`]. `label`
/// is what appears in logs and errors, so secrets passed as arguments never
/// leak.
pub(crate) async fn run<I, S>(program: &Path, args: I, label: &str) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_within(program, args, label, COMMAND_TIMEOUT).await
}

pub(crate) async fn run_within<I, S>(
    program: &Path,
    args: I,
    label: &str,
    limit: Duration,
) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    debug!(command = %label, limit_secs = limit.as_secs(), "Running command");
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    let output = tokio::time::timeout(limit, command.output())
        .await
        .map_err(|_| {
            warn!(command = %label, limit_secs = limit.as_secs(), "Command timed out");
            StackjoinError::command(label, format!("timed out after {:?}", limit))
        })?
        .map_err(|e| StackjoinError::command(label, e.to_string()))?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Like [`run`], but a non-zero exit becomes an error carrying stderr
pub(crate) async fn run_checked<I, S>(program: &Path, args: I, label: &str) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_checked_within(program, args, label, COMMAND_TIMEOUT).await
}

pub(crate) async fn run_checked_within<I, S>(
    program: &Path,
    args: I,
    label: &str,
    limit: Duration,
) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_within(program, args, label, limit).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(StackjoinError::command(label, output.stderr))
    }
}

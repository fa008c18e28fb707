//! External command execution.
//!
//! Every tool this crate drives (`ifconfig`, `bhyvectl`, `fstat`, ...) goes
//! through [`execute`], so output capture, logging, and failure reporting are
//! uniform.

use crate::error::{HostError, Result};
use std::fmt;
use std::process::{ExitStatus, Output};
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Details of a command that ran and exited non-zero.
#[derive(Debug)]
pub struct CommandFailure {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command [{}] failed with status {}", self.command, self.status)?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

/// Render a command as `program arg1 arg2 ...` for logs and errors.
pub(crate) fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a command for `program`, prefixed with `sudo` when `elevate` is set.
pub fn privileged(elevate: bool, program: &str) -> Command {
    if elevate {
        let mut cmd = Command::new("sudo");
        cmd.arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

/// Run a command to completion, capturing its output.
///
/// Returns the captured output on a zero exit status. A non-zero exit becomes
/// [`HostError::Process`] carrying stdout and stderr for diagnostics.
pub async fn execute(command: &mut Command) -> Result<Output> {
    let rendered = command_to_string(command.as_std());
    debug!(command = %rendered, "executing");

    let output = command
        .output()
        .await
        .map_err(|source| HostError::ExecutionStart {
            command: rendered.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    trace!(command = %rendered, stdout = %stdout.trim(), stderr = %stderr.trim(), "command output");

    if !output.status.success() {
        warn!(
            command = %rendered,
            status = %output.status,
            stderr = %stderr.trim(),
            "command failed"
        );
        return Err(HostError::Process(Box::new(CommandFailure {
            command: rendered,
            status: output.status,
            stdout,
            stderr,
        })));
    }

    debug!(command = %rendered, stdout_len = stdout.len(), "command completed");
    Ok(output)
}

//! Subprocess execution for `git` and `gh`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{PrflowError, Result};

/// Runs an external program and returns its stdout.
///
/// A non-zero exit is reported as [`PrflowError::CommandFailed`] carrying the
/// captured stderr, which is what the classifier inspects.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        working_dir: &Path,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>>;
}

/// [`CommandExecutor`] backed by `tokio::process`.
///
/// Children are spawned with `kill_on_drop`, so dropping the future (or
/// cancelling the token) tears the process down.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any single invocation that runs longer than `limit`.
    pub fn with_timeout(limit: Duration) -> Self {
        Self {
            timeout: Some(limit),
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(
        &self,
        cancel: &CancellationToken,
        working_dir: &Path,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(PrflowError::Canceled);
        }

        let child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GH_PROMPT_DISABLED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PrflowError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let output = match self.timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PrflowError::Canceled),
                res = tokio::time::timeout(limit, child.wait_with_output()) => {
                    res.map_err(|_| PrflowError::DeadlineExceeded {
                        program: program.to_string(),
                        limit,
                    })??
                }
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PrflowError::Canceled),
                res = child.wait_with_output() => res?,
            },
        };

        if !output.status.success() {
            return Err(PrflowError::CommandFailed {
                program: program.to_string(),
                args: args.to_vec(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

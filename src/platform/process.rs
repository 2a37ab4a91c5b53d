//! Bounded Subprocess Execution
//!
//! Every external binary runs with piped output, a wall-clock bound, and
//! `kill_on_drop`, so a timed-out or abandoned call never leaves a process
//! running.

use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Outcome of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr, or stdout when stderr is empty
    pub fn diagnostics(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

/// How a bounded run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(CommandOutput),
    TimedOut,
}

/// Run `program args...`, killing it after `timeout`
pub async fn run_bounded(program: &str, args: &[String], timeout: Duration) -> Result<RunOutcome> {
    debug!("Executing: {} {}", program, args.join(" "));
    let started = Instant::now();

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Tool {
            tool: program.to_string(),
            reason: format!("failed to spawn: {}", e),
        })?;

    // Dropping the child on timeout kills it
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            debug!(
                program,
                code = ?output.status.code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Process finished"
            );
            Ok(RunOutcome::Finished(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }))
        }
        Ok(Err(e)) => Err(Error::Tool {
            tool: program.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => {
            warn!(program, secs = timeout.as_secs(), "Process timed out and was killed");
            Ok(RunOutcome::TimedOut)
        }
    }
}

/// Run and require a zero exit status, returning stdout
pub async fn run_checked(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    match run_bounded(program, args, timeout).await? {
        RunOutcome::Finished(out) if out.success() => Ok(out.stdout),
        RunOutcome::Finished(out) => Err(Error::Tool {
            tool: program.to_string(),
            reason: format!("exit code {:?}: {}", out.code, out.diagnostics()),
        }),
        RunOutcome::TimedOut => Err(Error::Tool {
            tool: program.to_string(),
            reason: format!("timed out after {}s", timeout.as_secs()),
        }),
    }
}

/// Build an owned argument vector
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_run_checked_captures_stdout() {
        let out = run_checked("sh", &args(["-c", "echo hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let outcome = run_bounded(
            "sh",
            &args(["-c", "echo broken >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_matches!(outcome, RunOutcome::Finished(ref out) if out.code == Some(3) && out.diagnostics() == "broken");
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let started = Instant::now();
        let outcome = run_bounded("sleep", &args(["5"]), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = run_bounded("definitely-not-a-binary-xyz", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Tool { .. });
    }
}

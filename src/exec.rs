//! Running the host tools the agent drives (`systemctl`, `nft`, `ip`).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Upper bound on any single host tool invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Run `program` with `args`, optionally feeding `stdin`, and wait for it
/// for at most [`DEFAULT_TIMEOUT`].
///
/// # Errors
///
/// Returns `Error::Io` if the program cannot be spawned and
/// `Error::Internal` if it does not finish in time. A non-zero exit is
/// reported through [`CommandOutput::success`], not as an error.
pub async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput> {
    run_with_timeout(program, args, stdin, DEFAULT_TIMEOUT).await
}

/// [`run`] with an explicit deadline. The child is killed when it expires.
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput> {
    match tokio::time::timeout(timeout, spawn_and_wait(program, args, stdin)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(program = %program, args = ?args, timeout = ?timeout, "Command timed out; killed");
            Err(Error::Internal(format!("{program}: timed out after {timeout:?}")))
        }
    }
}

async fn spawn_and_wait(program: &str, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput> {
    debug!(program = %program, args = ?args, "Running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal(format!("{program}: stdin not captured")))?;
        pipe.write_all(input.as_bytes()).await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_from_stdin() {
        let out = run("cat", &[], Some("hello")).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let out = run("false", &[], None).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn hung_command_is_killed_at_deadline() {
        let started = std::time::Instant::now();
        let result = run_with_timeout("sleep", &["30"], None, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::Internal(ref m)) if m.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let result = run("/nonexistent/ztgate-no-such-tool", &[], None).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}

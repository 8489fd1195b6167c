//! Action process spawning and output capture.
//!
//! Both [`ActionRunner::describe`] and [`ActionRunner::run`] spawn the action
//! executable directly (no shell), capture stdout as the result and log
//! stderr. Processes are spawned with `kill_on_drop(true)` so an abandoned
//! run does not leave orphans behind.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::Action;

/// Set (to `1`) when the action should print its capability fragment.
pub const SPEC_ENV: &str = "ACTIONS_GATEWAY_ACTIONS_SPEC";

/// Absolute path of the connector executable, so actions can locate
/// resources relative to the installation.
pub const EXECUTABLE_ENV: &str = "ACTIONS_GATEWAY_EXECUTABLE";

/// Max output size per stream (4 MB).
///
/// Output beyond this limit is still drained from the pipe but discarded. A
/// truncation notice is appended to the returned string.
const MAX_ACTION_OUTPUT: usize = 4 * 1024 * 1024;

/// Runs actions from a fixed working directory.
#[derive(Debug, Clone)]
pub struct ActionRunner {
    work_dir: PathBuf,
    executable: String,
}

impl ActionRunner {
    /// `work_dir` is the directory actions run in (the client config's directory).
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            executable: resolve_executable(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Ask the action to describe itself; returns its stdout verbatim.
    pub async fn describe(&self, action: &Action) -> Result<String, ExecError> {
        let output = self.exec(action, None, true).await?;
        Ok(output)
    }

    /// Run the action with `payload` on stdin; returns its stdout.
    pub async fn run(&self, action: &Action, payload: &str) -> Result<String, ExecError> {
        self.exec(action, Some(payload), false).await
    }

    async fn exec(
        &self,
        action: &Action,
        payload: Option<&str>,
        describe: bool,
    ) -> Result<String, ExecError> {
        let mut cmd = Command::new(&action.path);
        cmd.current_dir(&self.work_dir)
            .env(EXECUTABLE_ENV, &self.executable)
            .stdin(if payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if describe {
            cmd.env(SPEC_ENV, "1");
        } else {
            cmd.env_remove(SPEC_ENV);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

        let input = payload.unwrap_or_default().as_bytes().to_vec();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The action may exit without reading its input; that is not an error.
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        };

        // Feed stdin and drain both pipes concurrently to avoid pipe deadlock
        let ((), stdout_data, stderr_data) = tokio::join!(
            feed,
            read_capped(&mut stdout, MAX_ACTION_OUTPUT),
            read_capped(&mut stderr, MAX_ACTION_OUTPUT),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        if !stderr_data.is_empty() {
            debug!(action = %action.name, stderr = %stderr_data, "Action wrote to stderr");
        }

        if status.success() {
            Ok(stdout_data)
        } else {
            Err(ExecError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stdout: stdout_data,
            })
        }
    }
}

/// Resolve our own executable path, following symlinks.
fn resolve_executable() -> String {
    std::env::current_exe()
        .and_then(std::fs::canonicalize)
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest.
///
/// Keeps reading past the cap instead of closing the pipe early, so a chatty
/// child never blocks on a full pipe or dies of SIGPIPE.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Errors from running an action.
#[derive(Debug)]
pub enum ExecError {
    /// The executable could not be started (not found, permission denied, ...).
    SpawnFailed(String),
    /// The process started but waiting on it failed.
    ProcessFailed(String),
    /// The action ran and exited unsuccessfully. Whatever it printed is kept.
    NonZeroExit { code: i32, stdout: String },
}

impl ExecError {
    /// Output the action produced before failing, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::NonZeroExit { stdout, .. } if !stdout.is_empty() => Some(stdout),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn action: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Action process error: {e}"),
            ExecError::NonZeroExit { code, .. } => write!(f, "Action exited with status {code}"),
        }
    }
}

impl std::error::Error for ExecError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::tests::write_script;

    #[tokio::test]
    async fn run_feeds_stdin_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let action = write_script(dir.path(), "upper", "tr a-z A-Z");
        let runner = ActionRunner::new(dir.path());

        let out = runner.run(&action, "hello").await.unwrap();
        assert_eq!(out, "HELLO");
    }

    #[tokio::test]
    async fn describe_sets_spec_marker() {
        let dir = tempfile::tempdir().unwrap();
        let action = write_script(
            dir.path(),
            "describe",
            "if [ -n \"$ACTIONS_GATEWAY_ACTIONS_SPEC\" ]; then echo 'summary: hi'; else echo run; fi",
        );
        let runner = ActionRunner::new(dir.path());

        assert_eq!(runner.describe(&action).await.unwrap(), "summary: hi\n");
        assert_eq!(runner.run(&action, "").await.unwrap(), "run\n");
    }

    #[tokio::test]
    async fn run_provides_executable_and_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let action = write_script(
            dir.path(),
            "where",
            "test -n \"$ACTIONS_GATEWAY_EXECUTABLE\" && pwd",
        );
        let runner = ActionRunner::new(dir.path());

        let out = runner.run(&action, "").await.unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            std::fs::canonicalize(out.trim()).unwrap(),
            expected,
            "action should run in the configured directory"
        );
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let action = write_script(dir.path(), "fail", "echo partial; exit 3");
        let runner = ActionRunner::new(dir.path());

        let err = runner.run(&action, "").await.unwrap_err();
        match err {
            ExecError::NonZeroExit { code, ref stdout } => {
                assert_eq!(code, 3);
                assert_eq!(stdout, "partial\n");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.output(), Some("partial\n"));
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let action = Action {
            name: "ghost".into(),
            path: dir.path().join("ghost"),
        };
        let runner = ActionRunner::new(dir.path());

        assert!(matches!(
            runner.run(&action, "").await,
            Err(ExecError::SpawnFailed(_))
        ));
    }

    #[tokio::test]
    async fn action_ignoring_stdin_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let action = write_script(dir.path(), "quiet", "echo ok");
        let runner = ActionRunner::new(dir.path());

        let payload = "x".repeat(256 * 1024);
        assert_eq!(runner.run(&action, &payload).await.unwrap(), "ok\n");
    }
}

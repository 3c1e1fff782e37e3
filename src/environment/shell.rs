//! Shell command execution with a timeout and an output cap.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EnvError;

/// Combined stdout+stderr kept per command.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Result of a finished shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Output exceeded the cap and the process was killed.
    pub truncated: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.truncated && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, with a notice when output was cut.
    pub fn combined(&self, max_output: usize) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len());
        text.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        if self.truncated {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[Output truncated: exceeded {} bytes, process terminated]",
                max_output
            ));
        }
        text
    }
}

fn spawn_reader<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Run `sh -c <command>` in `cwd`.
///
/// `env` is layered over the inherited process environment. On timeout the
/// child is killed and [`EnvError::Timeout`] is returned. Once `max_output`
/// bytes have been collected the child is killed and the output marked as
/// truncated.
pub async fn run(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
    max_output: usize,
) -> Result<ShellOutput, EnvError> {
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command, cwd = %cwd.display(), timeout_secs = timeout.as_secs(), "Running shell command");

    let mut child = cmd.spawn().map_err(|source| EnvError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let (tx, mut rx) = mpsc::channel(16);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Stream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Stream::Stderr, tx);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut truncated = false;

    let outcome = tokio::time::timeout(timeout, async {
        let mut total = 0usize;
        while let Some((stream, chunk)) = rx.recv().await {
            let take = chunk.len().min(max_output - total);
            match stream {
                Stream::Stdout => stdout.extend_from_slice(&chunk[..take]),
                Stream::Stderr => stderr.extend_from_slice(&chunk[..take]),
            }
            total += take;
            if take < chunk.len() {
                truncated = true;
                break;
            }
        }
        if truncated {
            warn!(command, limit = max_output, "Output limit reached, terminating command");
            let _ = child.start_kill();
        }
        child.wait().await
    })
    .await;

    let status = match outcome {
        Ok(status) => status?,
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "Command timed out, killing it");
            let _ = child.kill().await;
            return Err(EnvError::Timeout {
                command: command.to_string(),
                timeout,
            });
        }
    };

    let output = ShellOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        truncated,
        duration: start.elapsed(),
    };
    debug!(
        command,
        exit_code = ?output.exit_code,
        duration_ms = output.duration.as_millis() as u64,
        "Shell command finished"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sh(command: &str) -> Result<ShellOutput, EnvError> {
        let dir = std::env::temp_dir();
        run(command, &dir, &HashMap::new(), Duration::from_secs(10), MAX_OUTPUT_BYTES).await
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let out = sh("echo out; echo err 1>&2").await.unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(out.success());
        assert_eq!(out.combined(MAX_OUTPUT_BYTES), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_exit_code() {
        let out = sh("echo nope; exit 3").await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
        let out = run("echo $GREETING; pwd", dir.path(), &env, Duration::from_secs(10), 1024)
            .await
            .unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines[0], "hello");
        let reported = std::fs::canonicalize(lines[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = std::env::temp_dir();
        let start = Instant::now();
        let err = run("sleep 5", &dir, &HashMap::new(), Duration::from_millis(300), 1024)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_output_cap_truncates() {
        let dir = std::env::temp_dir();
        let out = run("yes", &dir, &HashMap::new(), Duration::from_secs(10), 4096)
            .await
            .unwrap();
        assert!(out.truncated);
        assert_eq!(out.stdout.len(), 4096);
        assert!(out
            .combined(4096)
            .ends_with("[Output truncated: exceeded 4096 bytes, process terminated]"));
    }
}

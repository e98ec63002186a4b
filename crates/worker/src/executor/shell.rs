//! Shell backend: runs the command described by the job payload.
//!
//! ```json
//! { "type": "shell", "command": "echo", "args": ["hi"], "timeout": "5m" }
//! ```
//!
//! `type` may be omitted; when present it must be `shell`. The command is
//! executed directly (no shell interpolation). Its own `timeout` (default
//! 30s) applies on top of the processor's deadline.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExecutionBackend, ExecutionError, ExecutionOutput};
use crate::duration::parse_duration;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ShellPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    timeout: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShellBackend;

impl ShellBackend {
    pub fn new() -> Self {
        Self
    }

    fn parse(payload: &Value) -> Result<(ShellPayload, Duration), ExecutionError> {
        let parsed = ShellPayload::deserialize(payload)
            .map_err(|e| ExecutionError::InvalidPayload(e.to_string()))?;

        if let Some(kind) = parsed.kind.as_deref() {
            if kind != "shell" {
                return Err(ExecutionError::InvalidPayload(format!(
                    "unsupported execution type `{kind}`"
                )));
            }
        }
        if parsed.command.trim().is_empty() {
            return Err(ExecutionError::InvalidPayload("`command` is empty".to_string()));
        }

        let timeout = match parsed.timeout.as_deref() {
            None | Some("") => DEFAULT_COMMAND_TIMEOUT,
            Some(raw) => parse_duration(raw).map_err(|e| {
                ExecutionError::InvalidPayload(format!("invalid timeout format: {e}"))
            })?,
        };

        Ok((parsed, timeout))
    }
}

/// How long to keep reading pipes after the child has exited or been
/// killed (a grandchild may still hold them open).
const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Bytes read from one child pipe so far.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn spawn<R>(pipe: Option<R>) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = Capture::default();
        let sink = capture.clone();
        let reader = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.0.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        });
        (capture, reader)
    }

    /// Wait (bounded) for the reader to hit EOF, then take what was read.
    async fn finish(self, reader: JoinHandle<()>) -> Option<String> {
        let abort = reader.abort_handle();
        if tokio::time::timeout(PIPE_DRAIN, reader).await.is_err() {
            abort.abort();
        }
        let bytes = self.0.lock().map(|mut b| std::mem::take(&mut *b)).ok()?;
        if bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

#[async_trait]
impl ExecutionBackend for ShellBackend {
    async fn execute(&self, payload: &Value) -> Result<ExecutionOutput, ExecutionError> {
        let (spec, timeout) = Self::parse(payload)?;
        debug!(command = %spec.command, args = ?spec.args, "running shell command");

        // Dropping the future (processor deadline or shutdown) kills the child.
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Spawn(format!("{}: {e}", spec.command)))?;

        let (stdout, stdout_reader) = Capture::spawn(child.stdout.take());
        let (stderr, stderr_reader) = Capture::spawn(child.stderr.take());

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Some(status.map_err(|e| ExecutionError::Spawn(e.to_string()))?),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(command = %spec.command, error = %e, "failed to kill timed out command");
                }
                None
            }
        };

        let captured = ExecutionOutput {
            stdout: stdout.finish(stdout_reader).await,
            stderr: stderr.finish(stderr_reader).await,
            exit_code: status.and_then(|s| s.code()),
        };

        match status {
            None => Err(ExecutionError::CommandTimedOut {
                after: timeout,
                output: captured,
            }),
            Some(status) if status.success() => Ok(captured),
            Some(status) => Err(ExecutionError::NonZeroExit {
                code: status.code(),
                output: captured,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_payload_with_defaults() {
        let (spec, timeout) = ShellBackend::parse(&json!({ "command": "true" })).unwrap();
        assert_eq!(spec.command, "true");
        assert!(spec.args.is_empty());
        assert_eq!(timeout, DEFAULT_COMMAND_TIMEOUT);

        let (_, timeout) =
            ShellBackend::parse(&json!({ "type": "shell", "command": "ls", "timeout": "5m" }))
                .unwrap();
        assert_eq!(timeout, Duration::from_secs(300));
    }

    #[test]
    fn rejects_bad_payloads() {
        for payload in [
            json!({}),
            json!({ "command": "" }),
            json!({ "type": "http", "command": "ls" }),
            json!({ "command": "ls", "timeout": "soon" }),
            json!("ls"),
        ] {
            assert!(matches!(
                ShellBackend::parse(&payload),
                Err(ExecutionError::InvalidPayload(_))
            ));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = ShellBackend::new()
            .execute(&json!({ "command": "echo", "args": ["hello"] }))
            .await
            .unwrap();
        assert_eq!(out.stdout.as_deref(), Some("hello\n"));
        assert_eq!(out.stderr, None);
        assert_eq!(out.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let err = ShellBackend::new()
            .execute(&json!({ "command": "sh", "args": ["-c", "echo oops >&2; exit 3"] }))
            .await
            .unwrap_err();
        match err {
            ExecutionError::NonZeroExit { code, output } => {
                assert_eq!(code, Some(3));
                assert_eq!(output.stderr.as_deref(), Some("oops\n"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn own_timeout_stops_the_command() {
        let started = std::time::Instant::now();
        let err = ShellBackend::new()
            .execute(&json!({ "command": "sleep", "args": ["5"], "timeout": "100ms" }))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            ExecutionError::CommandTimedOut { after, output } => {
                assert_eq!(after, Duration::from_millis(100));
                assert_eq!(output.stdout, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn own_timeout_keeps_output_written_so_far() {
        let err = ShellBackend::new()
            .execute(&json!({
                "command": "sh",
                "args": ["-c", "echo started; echo warming >&2; exec sleep 5"],
                "timeout": "1.5s"
            }))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let output = err.output().unwrap();
        assert_eq!(output.stdout.as_deref(), Some("started\n"));
        assert_eq!(output.stderr.as_deref(), Some("warming\n"));
        assert_eq!(output.exit_code, Some(124));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = ShellBackend::new()
            .execute(&json!({ "command": "relay-definitely-not-a-binary" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn(_)));
    }
}

//! Execution backends: what actually runs a job's payload.
//!
//! The processor owns the deadline. Backends only need to stop promptly when
//! their future is dropped (the processor aborts the task on timeout or
//! shutdown); `ShellBackend` kills its child process in that case.

pub mod shell;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use shell::ShellBackend;
pub use simulated::SimulatedBackend;

/// Exit code reported for deadline expiry (matches coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Output captured from one execution attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
}

impl ExecutionOutput {
    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }
}

/// Why an execution attempt failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// The payload is not something this backend can run.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    /// The process could not be started.
    #[error("failed to start command: {0}")]
    Spawn(String),

    /// The command ran and exited unsuccessfully.
    #[error("command exited with status {}", exit_label(.code))]
    NonZeroExit {
        code: Option<i32>,
        output: ExecutionOutput,
    },

    /// The job itself reported failure.
    #[error("{0}")]
    Failed(String),

    #[error("job execution timed out after {after:?}")]
    TimedOut { after: Duration },

    /// The command hit its own timeout; `output` holds what it wrote first.
    #[error("command timed out after {after:?}")]
    CommandTimedOut {
        after: Duration,
        output: ExecutionOutput,
    },

    #[error("job execution cancelled by shutdown")]
    Cancelled,

    #[error("job execution panicked: {0}")]
    Panicked(String),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

impl ExecutionError {
    /// Deadline expiry (processor deadline or the command's own timeout).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExecutionError::TimedOut { .. } | ExecutionError::CommandTimedOut { .. }
        )
    }

    /// Output to attach to the failure log, if any was captured.
    pub fn output(&self) -> Option<ExecutionOutput> {
        match self {
            ExecutionError::NonZeroExit { output, .. } => Some(output.clone()),
            ExecutionError::CommandTimedOut { output, .. } => Some(ExecutionOutput {
                exit_code: Some(TIMEOUT_EXIT_CODE),
                ..output.clone()
            }),
            ExecutionError::TimedOut { .. } => {
                Some(ExecutionOutput::with_exit_code(TIMEOUT_EXIT_CODE))
            }
            _ => None,
        }
    }
}

/// Runs a job payload.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, payload: &serde_json::Value) -> Result<ExecutionOutput, ExecutionError>;
}

#[async_trait]
impl<B> ExecutionBackend for Arc<B>
where
    B: ExecutionBackend + ?Sized,
{
    async fn execute(&self, payload: &serde_json::Value) -> Result<ExecutionOutput, ExecutionError> {
        (**self).execute(payload).await
    }
}

/// Backend selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendKind {
    /// Sleeps or fails on request; no side effects.
    #[default]
    Simulated,
    /// Runs the command described by the payload.
    Shell,
}

impl BackendKind {
    pub fn build(self) -> Arc<dyn ExecutionBackend> {
        match self {
            BackendKind::Simulated => Arc::new(SimulatedBackend::new()),
            BackendKind::Shell => Arc::new(ShellBackend::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_report_exit_124() {
        let err = ExecutionError::TimedOut {
            after: Duration::from_secs(30),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "job execution timed out after 30s");
        assert_eq!(err.output().and_then(|o| o.exit_code), Some(TIMEOUT_EXIT_CODE));
    }

    #[test]
    fn non_zero_exit_carries_output() {
        let output = ExecutionOutput {
            stdout: Some("out".into()),
            stderr: Some("boom".into()),
            exit_code: Some(3),
        };
        let err = ExecutionError::NonZeroExit {
            code: Some(3),
            output: output.clone(),
        };
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "command exited with status 3");
        assert_eq!(err.output(), Some(output));
    }

    #[test]
    fn command_timeout_keeps_partial_output() {
        let err = ExecutionError::CommandTimedOut {
            after: Duration::from_secs(5),
            output: ExecutionOutput {
                stdout: Some("half".into()),
                stderr: None,
                exit_code: None,
            },
        };
        let output = err.output().unwrap();
        assert_eq!(output.stdout.as_deref(), Some("half"));
        assert_eq!(output.exit_code, Some(TIMEOUT_EXIT_CODE));
    }

    #[test]
    fn harness_errors_have_no_output() {
        assert_eq!(ExecutionError::Spawn("nope".into()).output(), None);
        assert_eq!(ExecutionError::Cancelled.output(), None);
    }
}

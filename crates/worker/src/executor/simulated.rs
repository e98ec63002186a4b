//! Simulated backend for demos and tests.
//!
//! Payload fields:
//! - `fail: true` → the attempt fails with "simulated job failure"
//! - `sleep: N` → the attempt takes `N` seconds (default 2)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{ExecutionBackend, ExecutionError, ExecutionOutput};

const DEFAULT_SLEEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend;

impl SimulatedBackend {
    pub fn new() -> Self {
        Self
    }

    fn sleep_for(payload: &Value) -> Result<Duration, ExecutionError> {
        match payload.get("sleep") {
            None | Some(Value::Null) => Ok(DEFAULT_SLEEP),
            Some(v) => v
                .as_f64()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| {
                    ExecutionError::InvalidPayload(format!(
                        "`sleep` must be a non-negative number of seconds, got {v}"
                    ))
                }),
        }
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn execute(&self, payload: &Value) -> Result<ExecutionOutput, ExecutionError> {
        if payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ExecutionError::Failed("simulated job failure".to_string()));
        }

        let sleep = Self::sleep_for(payload)?;
        debug!(sleep_ms = sleep.as_millis() as u64, "simulating job work");
        tokio::time::sleep(sleep).await;

        Ok(ExecutionOutput::with_exit_code(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_requested_seconds() {
        let start = tokio::time::Instant::now();
        let out = SimulatedBackend::new()
            .execute(&json!({ "sleep": 1 }))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn defaults_to_two_seconds() {
        let start = tokio::time::Instant::now();
        SimulatedBackend::new().execute(&json!({})).await.unwrap();
        assert_eq!(start.elapsed(), DEFAULT_SLEEP);
    }

    #[tokio::test]
    async fn fail_flag_fails() {
        let err = SimulatedBackend::new()
            .execute(&json!({ "fail": true }))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Failed("simulated job failure".into()));
    }

    #[tokio::test]
    async fn out_of_range_sleep_is_invalid() {
        for sleep in [json!(-1), json!(1e30), json!("soon")] {
            let err = SimulatedBackend::new()
                .execute(&json!({ "sleep": sleep }))
                .await
                .unwrap_err();
            assert!(matches!(err, ExecutionError::InvalidPayload(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn huge_sleep_fails_without_panicking_the_task() {
        let joined = tokio::spawn(async {
            SimulatedBackend::new()
                .execute(&json!({ "sleep": 1e30 }))
                .await
        })
        .await;
        assert!(matches!(joined, Ok(Err(ExecutionError::InvalidPayload(_)))));
    }
}

//! Job record and status machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::JobId;
use crate::retry::RetryDecision;

/// Execution deadline applied when a job carries no positive `timeout_seconds`.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry ceiling applied at creation when the caller gives none.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job execution status.
///
/// ```text
/// pending --claim--> in_progress --success--> completed
///                    in_progress --failure, retries <  max--> pending
///                    in_progress --failure, retries >= max--> dead
/// ```
///
/// `Failed` is a legacy terminal state kept so older rows still load; the
/// worker never writes it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Owned by exactly one worker
    InProgress,
    /// Finished successfully
    Completed,
    /// Legacy exhausted-retry state
    Failed,
    /// Exhausted retries (dead-letter)
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    /// Only pending jobs may be claimed for execution.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Dead)
    }

    /// Whether the worker's state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Pending)
                | (JobStatus::InProgress, JobStatus::Dead)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub parent_job_id: Option<JobId>,
    pub title: String,
    pub description: Option<String>,
    /// Opaque document, interpreted only by the execution backend.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Retries already scheduled (starts at 0).
    pub retries: u32,
    pub max_retries: u32,
    pub timeout_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Deadline for one execution attempt.
    pub fn execution_timeout(&self, default: Duration) -> Duration {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => default,
        }
    }

    /// Decide what happens after a failed attempt.
    pub fn retry_decision(&self) -> RetryDecision {
        RetryDecision::after_failure(self.retries, self.max_retries)
    }
}

/// Parameters for creating a job (what the external API submits).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub parent_job_id: Option<JobId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub payload: serde_json::Value,
    /// Negative or absent means [`DEFAULT_MAX_RETRIES`]; 0 disables retries.
    #[serde(default)]
    pub max_retries: Option<i32>,
    /// Non-positive or absent means [`DEFAULT_EXECUTION_TIMEOUT`].
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
}

impl NewJob {
    pub fn new(title: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_seconds(mut self, secs: i32) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent_job_id = Some(parent);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.title.trim().is_empty() {
            return Err(DomainError::validation("title is required"));
        }
        if self.payload.is_null() {
            return Err(DomainError::validation("payload is required"));
        }
        Ok(())
    }

    /// Retry ceiling after applying creation defaults.
    ///
    /// An explicit `0` is kept: it means "never retry".
    pub fn resolved_max_retries(&self) -> u32 {
        match self.max_retries {
            Some(n) if n >= 0 => n as u32,
            _ => DEFAULT_MAX_RETRIES,
        }
    }

    /// Timeout after applying creation defaults.
    pub fn resolved_timeout_seconds(&self) -> i32 {
        match self.timeout_seconds {
            Some(n) if n > 0 => n,
            _ => DEFAULT_EXECUTION_TIMEOUT.as_secs() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(timeout_seconds: Option<i32>) -> Job {
        Job {
            id: JobId::new(1).unwrap(),
            parent_job_id: None,
            title: "t".into(),
            description: None,
            payload: serde_json::json!({}),
            status: JobStatus::Pending,
            retries: 0,
            max_retries: 3,
            timeout_seconds,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn timeout_falls_back_to_default() {
        let default = DEFAULT_EXECUTION_TIMEOUT;
        assert_eq!(job(None).execution_timeout(default), default);
        assert_eq!(job(Some(0)).execution_timeout(default), default);
        assert_eq!(job(Some(-5)).execution_timeout(default), default);
        assert_eq!(job(Some(7)).execution_timeout(default), Duration::from_secs(7));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_pending_is_claimable() {
        assert!(JobStatus::Pending.is_claimable());
        assert!(!JobStatus::InProgress.is_claimable());
        assert!(!JobStatus::Completed.is_claimable());
        assert!(!JobStatus::Dead.is_claimable());
    }

    #[test]
    fn worker_never_transitions_into_failed() {
        let all = [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ];
        for from in all {
            assert!(!from.can_transition_to(JobStatus::Failed));
        }
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Dead));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn new_job_defaults() {
        let new = NewJob::new("t", serde_json::json!({"sleep": 1}));
        assert_eq!(new.resolved_max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(new.resolved_timeout_seconds(), 30);

        let new = new.with_max_retries(0).with_timeout_seconds(-1);
        assert_eq!(new.resolved_max_retries(), 0);
        assert_eq!(new.resolved_timeout_seconds(), 30);
    }

    #[test]
    fn new_job_requires_title_and_payload() {
        assert!(NewJob::new("", serde_json::json!({})).validate().is_err());
        assert!(NewJob::new("t", serde_json::Value::Null).validate().is_err());
        assert!(NewJob::new("t", serde_json::json!({})).validate().is_ok());
    }
}

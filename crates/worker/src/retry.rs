//! Retry/requeue scheduling for failed attempts.
//!
//! A failed attempt either goes back to `pending` with `retries + 1` and is
//! republished after `2^(retries + 1)` seconds, or is dead-lettered once the
//! retry budget is spent. The retry count is persisted before the requeue is
//! scheduled.
//!
//! Requeues are fire-and-forget timers tracked by a `TaskTracker`. On
//! shutdown, pending timers are abandoned with a warning; the job stays
//! `pending` with its incremented count and is picked up again by a later
//! enqueue or by the polling consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use relay_broker::{Broker, BrokerError};
use relay_core::{Job, JobId, JobStatus, NewJobLog, RetryDecision};
use relay_infra::{JobRepository, RepositoryError};

use crate::executor::ExecutionError;

/// Where a retried job id is sent once its backoff elapses.
#[async_trait]
pub trait Requeue: Send + Sync {
    /// Called synchronously when a requeue is scheduled, before the timer
    /// starts.
    fn scheduled(&self, _job_id: JobId) {}

    async fn requeue(&self, job_id: JobId) -> Result<(), BrokerError>;
}

/// Republishes retried jobs to the broker (same encoding, same stream).
pub struct BrokerRequeue {
    broker: Arc<dyn Broker>,
}

impl BrokerRequeue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Requeue for BrokerRequeue {
    async fn requeue(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.broker.publish(job_id).await
    }
}

pub struct RetryScheduler {
    repo: Arc<dyn JobRepository>,
    requeue: Arc<dyn Requeue>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl RetryScheduler {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        requeue: Arc<dyn Requeue>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            requeue,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Number of requeue timers still running.
    pub fn pending_requeues(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting requeues and wait for the outstanding timers to finish
    /// (or be abandoned, once shutdown is signalled).
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// Errors mean the job's status could not be persisted; nothing is
    /// requeued in that case.
    pub async fn handle_failure(
        &self,
        job: &Job,
        failure: &ExecutionError,
    ) -> Result<RetryDecision, RepositoryError> {
        let output = failure.output().unwrap_or_default();
        let attempt_log = NewJobLog::warn(job.id, format!("job attempt failed: {failure}"))
            .with_output(output.stdout, output.stderr, output.exit_code);
        if let Err(e) = self.repo.create_job_log(attempt_log).await {
            warn!(job_id = %job.id, error = %e, "failed to record failed attempt");
        }

        let decision = job.retry_decision();
        match decision {
            RetryDecision::Retry { attempt, backoff } => {
                self.repo
                    .update_job_status(job.id, JobStatus::Pending, attempt)
                    .await?;
                info!(
                    job_id = %job.id,
                    attempt,
                    max_retries = job.max_retries,
                    backoff_secs = backoff.as_secs(),
                    "job failed, retry scheduled"
                );
                self.schedule(job.id, backoff);
            }
            RetryDecision::DeadLetter => {
                let message = format!(
                    "job has reached max retries ({}), marking as dead",
                    job.max_retries
                );
                error!(job_id = %job.id, retries = job.retries, error = %failure, "{}", message);
                if let Err(e) = self.repo.create_job_log(NewJobLog::error(job.id, message)).await {
                    warn!(job_id = %job.id, error = %e, "failed to record dead-letter log");
                }
                self.repo
                    .update_job_status(job.id, JobStatus::Dead, job.retries)
                    .await?;
            }
        }

        Ok(decision)
    }

    /// Republish `job_id` after `backoff`, unless shutdown comes first.
    pub fn schedule(&self, job_id: JobId, backoff: Duration) {
        self.requeue.scheduled(job_id);

        let requeue = self.requeue.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(job_id = %job_id, "shutdown before retry requeue; job left pending");
                }
                _ = tokio::time::sleep(backoff) => match requeue.requeue(job_id).await {
                    Ok(()) => info!(job_id = %job_id, "job requeued for retry"),
                    Err(e) => error!(job_id = %job_id, error = %e, "failed to requeue job"),
                },
            }
        });
    }
}

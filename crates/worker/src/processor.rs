//! Per-job processing: lock, claim, execute under a deadline, resolve.
//!
//! ```text
//! pending --claim--> in_progress --success--> completed
//!                    in_progress --failure, retries < max--> pending (requeued)
//!                    in_progress --failure, retries >= max--> dead
//! ```
//!
//! Every step is an early-exit point. Nothing returned from
//! [`JobProcessor::process`] is an error: coordination failures are logged
//! and reported as [`ProcessOutcome::Aborted`], and the lock is released on
//! every path.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use relay_core::{DEFAULT_EXECUTION_TIMEOUT, Job, JobId, JobStatus, NewJobLog, RetryDecision};
use relay_infra::JobRepository;

use crate::executor::{ExecutionBackend, ExecutionError, ExecutionOutput};
use crate::lock::LockManager;
use crate::retry::RetryScheduler;

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Lock TTL (`T`); the watchdog renews every `T/2`.
    pub lock_ttl: Duration,
    pub use_watchdog: bool,
    /// Deadline for jobs without a positive `timeout_seconds`.
    pub default_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            use_watchdog: true,
            default_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

impl ProcessorConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_watchdog(mut self, enabled: bool) -> Self {
        self.use_watchdog = enabled;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Why a message was handled without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds the job's lock.
    LockHeld,
    NotFound,
    /// The job was no longer `pending` when claimed.
    NotPending(JobStatus),
}

/// What a single `process` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Skipped(SkipReason),
    /// A lock store or repository call failed; see logs.
    Aborted,
    Completed,
    RetryScheduled { attempt: u32, backoff: Duration },
    DeadLettered,
}

pub struct JobProcessor {
    repo: Arc<dyn JobRepository>,
    locks: LockManager,
    backend: Arc<dyn ExecutionBackend>,
    retries: Arc<RetryScheduler>,
    config: ProcessorConfig,
    shutdown: CancellationToken,
}

impl JobProcessor {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        locks: LockManager,
        backend: Arc<dyn ExecutionBackend>,
        retries: Arc<RetryScheduler>,
        config: ProcessorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            locks,
            backend,
            retries,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process one delivery of `job_id`.
    #[instrument(skip(self, job_id), fields(job_id = %job_id))]
    pub async fn process(&self, job_id: JobId) -> ProcessOutcome {
        let guard = match self
            .locks
            .lock(job_id.lock_key(), self.config.lock_ttl, self.config.use_watchdog)
            .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("job is being processed by another worker, skipping");
                return ProcessOutcome::Skipped(SkipReason::LockHeld);
            }
            Err(e) => {
                error!(error = %e, "failed to acquire job lock");
                return ProcessOutcome::Aborted;
            }
        };

        let outcome = self.process_locked(job_id).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release job lock");
        }
        outcome
    }

    async fn process_locked(&self, job_id: JobId) -> ProcessOutcome {
        let job = match self.repo.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                info!("job not found, skipping");
                return ProcessOutcome::Skipped(SkipReason::NotFound);
            }
            Err(e) => {
                error!(error = %e, "failed to load job");
                return ProcessOutcome::Aborted;
            }
        };

        if !job.status.is_claimable() {
            info!(status = %job.status, "job is not pending, skipping");
            return ProcessOutcome::Skipped(SkipReason::NotPending(job.status));
        }

        let started = NewJobLog::info(job_id, format!("processing job: {}", job.title));
        if let Err(e) = self.repo.create_job_log(started).await {
            warn!(error = %e, "failed to record job start");
        }

        let job = match self
            .repo
            .update_job_status(job_id, JobStatus::InProgress, job.retries)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "failed to mark job in progress");
                return ProcessOutcome::Aborted;
            }
        };

        let deadline = job.execution_timeout(self.config.default_timeout);
        info!(
            title = %job.title,
            attempt = job.retries,
            deadline_secs = deadline.as_secs(),
            "processing job"
        );

        match self.execute(&job, deadline).await {
            Ok(output) => self.complete(&job, output).await,
            Err(failure) => self.fail(&job, failure).await,
        }
    }

    /// Run the backend as its own task, racing the deadline and shutdown.
    async fn execute(&self, job: &Job, deadline: Duration) -> Result<ExecutionOutput, ExecutionError> {
        let backend = self.backend.clone();
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { backend.execute(&payload).await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(ExecutionError::Panicked(e.to_string())),
            },
            _ = tokio::time::sleep(deadline) => {
                task.abort();
                Err(ExecutionError::TimedOut { after: deadline })
            }
            _ = self.shutdown.cancelled() => {
                task.abort();
                Err(ExecutionError::Cancelled)
            }
        }
    }

    async fn complete(&self, job: &Job, output: ExecutionOutput) -> ProcessOutcome {
        if let Err(e) = self
            .repo
            .update_job_status(job.id, JobStatus::Completed, job.retries)
            .await
        {
            error!(error = %e, "failed to mark job completed");
            return ProcessOutcome::Aborted;
        }

        let done = NewJobLog::info(job.id, "job completed successfully").with_output(
            output.stdout,
            output.stderr,
            output.exit_code,
        );
        if let Err(e) = self.repo.create_job_log(done).await {
            warn!(error = %e, "failed to record job completion");
        }

        info!("job completed successfully");
        ProcessOutcome::Completed
    }

    async fn fail(&self, job: &Job, failure: ExecutionError) -> ProcessOutcome {
        if failure.is_timeout() {
            warn!(error = %failure, attempt = job.retries, "job execution timed out");
        } else {
            warn!(error = %failure, attempt = job.retries, "job execution failed");
        }

        match self.retries.handle_failure(job, &failure).await {
            Ok(RetryDecision::Retry { attempt, backoff }) => {
                ProcessOutcome::RetryScheduled { attempt, backoff }
            }
            Ok(RetryDecision::DeadLetter) => ProcessOutcome::DeadLettered,
            Err(e) => {
                error!(error = %e, "failed to persist job failure");
                ProcessOutcome::Aborted
            }
        }
    }
}

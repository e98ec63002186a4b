//! Job repository boundary.
//!
//! Transactional storage for job records and their append-only logs. Every
//! mutation the worker performs is a single-row update keyed by job id; no
//! cross-row transactions are required.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use relay_core::{DomainError, Job, JobId, JobLog, JobStatus, NewJob, NewJobLog};

pub use in_memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;

/// Repository error.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Job repository abstraction.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Fetch a job by id (`None` if it does not exist).
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, RepositoryError>;

    /// All jobs currently `pending`, oldest first.
    async fn list_pending_jobs(&self) -> Result<Vec<Job>, RepositoryError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, RepositoryError>;

    /// Create a job in `pending` with creation defaults applied.
    async fn create_job(&self, job: NewJob) -> Result<Job, RepositoryError>;

    /// Persist a new status and retry count for a job.
    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        retries: u32,
    ) -> Result<Job, RepositoryError>;

    /// Append a log entry.
    async fn create_job_log(&self, log: NewJobLog) -> Result<JobLog, RepositoryError>;

    /// Log entries for a job, in append order.
    async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, RepositoryError>;
}

#[async_trait]
impl<R> JobRepository for Arc<R>
where
    R: JobRepository + ?Sized,
{
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        (**self).get_job(id).await
    }

    async fn list_pending_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        (**self).list_pending_jobs().await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        (**self).list_jobs().await
    }

    async fn create_job(&self, job: NewJob) -> Result<Job, RepositoryError> {
        (**self).create_job(job).await
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        retries: u32,
    ) -> Result<Job, RepositoryError> {
        (**self).update_job_status(id, status, retries).await
    }

    async fn create_job_log(&self, log: NewJobLog) -> Result<JobLog, RepositoryError> {
        (**self).create_job_log(log).await
    }

    async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, RepositoryError> {
        (**self).list_job_logs(job_id).await
    }
}

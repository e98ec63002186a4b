//! In-memory job repository for tests/dev.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use relay_core::{Job, JobId, JobLog, JobStatus, NewJob, NewJobLog};

use super::{JobRepository, RepositoryError};

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    logs: Vec<JobLog>,
    next_job_id: i64,
    next_log_id: i64,
}

/// In-memory repository.
///
/// Counts every mutation made through the worker-facing operations
/// (`update_job_status`, `create_job_log`) so tests can assert that a code
/// path left storage untouched.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    state: RwLock<State>,
    writes: AtomicU64,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of status updates and log appends performed so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, RepositoryError> {
        self.state
            .read()
            .map_err(|_| RepositoryError::Storage("state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, RepositoryError> {
        self.state
            .write()
            .map_err(|_| RepositoryError::Storage("state lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn list_pending_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let state = self.read()?;
        let mut pending: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();

        // FIFO by creation time; id breaks ties
        pending.sort_by_key(|j| (j.created_at, j.id));
        Ok(pending)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn create_job(&self, new: NewJob) -> Result<Job, RepositoryError> {
        new.validate()?;

        let mut state = self.write()?;
        if let Some(parent) = new.parent_job_id {
            if !state.jobs.contains_key(&parent) {
                return Err(RepositoryError::NotFound(parent));
            }
        }

        state.next_job_id += 1;
        let id = JobId::new(state.next_job_id)?;
        let job = Job {
            id,
            parent_job_id: new.parent_job_id,
            max_retries: new.resolved_max_retries(),
            timeout_seconds: Some(new.resolved_timeout_seconds()),
            title: new.title,
            description: new.description,
            payload: new.payload,
            status: JobStatus::Pending,
            retries: 0,
            created_at: Utc::now(),
        };
        state.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        retries: u32,
    ) -> Result<Job, RepositoryError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        job.status = status;
        job.retries = retries;
        let updated = job.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn create_job_log(&self, log: NewJobLog) -> Result<JobLog, RepositoryError> {
        let mut state = self.write()?;
        if !state.jobs.contains_key(&log.job_id) {
            return Err(RepositoryError::NotFound(log.job_id));
        }

        state.next_log_id += 1;
        let stored = JobLog {
            id: state.next_log_id,
            job_id: log.job_id,
            level: log.level,
            message: log.message,
            stdout: log.stdout,
            stderr: log.stderr,
            exit_code: log.exit_code,
            created_at: Utc::now(),
        };
        state.logs.push(stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, RepositoryError> {
        Ok(self
            .read()?
            .logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::LogLevel;

    #[tokio::test]
    async fn create_applies_defaults() {
        let repo = InMemoryJobRepository::new();
        let job = repo
            .create_job(NewJob::new("t", serde_json::json!({"sleep": 1})))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout_seconds, Some(30));
        assert_eq!(repo.writes(), 0);
    }

    #[tokio::test]
    async fn ids_are_sequential() {
        let repo = InMemoryJobRepository::new();
        let a = repo.create_job(NewJob::new("a", serde_json::json!({}))).await.unwrap();
        let b = repo.create_job(NewJob::new("b", serde_json::json!({}))).await.unwrap();
        assert_eq!(a.id.get() + 1, b.id.get());
    }

    #[tokio::test]
    async fn rejects_unknown_parent() {
        let repo = InMemoryJobRepository::new();
        let missing = JobId::new(99).unwrap();
        let err = repo
            .create_job(NewJob::new("child", serde_json::json!({})).with_parent(missing))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn update_status_and_list_pending() {
        let repo = InMemoryJobRepository::new();
        let a = repo.create_job(NewJob::new("a", serde_json::json!({}))).await.unwrap();
        let b = repo.create_job(NewJob::new("b", serde_json::json!({}))).await.unwrap();

        let updated = repo
            .update_job_status(a.id, JobStatus::InProgress, 0)
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::InProgress);

        let pending = repo.list_pending_jobs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        assert_eq!(repo.list_jobs().await.unwrap().len(), 2);
        assert_eq!(repo.writes(), 1);
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let repo = InMemoryJobRepository::new();
        let err = repo
            .update_job_status(JobId::new(5).unwrap(), JobStatus::Dead, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn logs_are_appended_per_job() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create_job(NewJob::new("t", serde_json::json!({}))).await.unwrap();

        repo.create_job_log(NewJobLog::info(job.id, "first")).await.unwrap();
        repo.create_job_log(
            NewJobLog::error(job.id, "second").with_output(None, Some("boom".into()), Some(1)),
        )
        .await
        .unwrap();

        let logs = repo.list_job_logs(job.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[1].stderr.as_deref(), Some("boom"));
        assert_eq!(logs[1].exit_code, Some(1));
        assert!(logs[0].id < logs[1].id);
    }
}

//! Postgres-backed job repository.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (foreign key violation) | `23503` | `Validation` | Unknown `parent_job_id` / log for a missing job |
//! | Database (check constraint violation) | `23514` | `Validation` | Negative retry counts, unknown status text |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Connectivity problems |
//!
//! ## Thread Safety
//!
//! `PostgresJobRepository` is `Send + Sync`; all operations go through the
//! SQLx connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::instrument;

use relay_core::{DomainError, Job, JobId, JobLog, JobStatus, NewJob, NewJobLog};

use super::{JobRepository, RepositoryError};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

const JOB_COLUMNS: &str = "id, parent_job_id, title, description, payload, status, \
                           retries, max_retries, timeout_seconds, created_at";

const LOG_COLUMNS: &str = "id, job_id, level, message, stdout, stderr, exit_code, created_at";

/// Postgres job repository.
#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobRepository {
    /// Create a repository over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` / `job_logs` tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.get())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_pending_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pending_jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self, job), fields(title = %job.title), err)]
    async fn create_job(&self, job: NewJob) -> Result<Job, RepositoryError> {
        job.validate()?;

        let row: JobRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO jobs (parent_job_id, title, description, payload, max_retries, timeout_seconds)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.parent_job_id.map(|p| p.get()))
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.payload)
        .bind(job.resolved_max_retries() as i32)
        .bind(job.resolved_timeout_seconds())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;

        Job::try_from(row)
    }

    #[instrument(skip(self), fields(job_id = %id, status = %status), err)]
    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        retries: u32,
    ) -> Result<Job, RepositoryError> {
        let retries = i32::try_from(retries)
            .map_err(|_| DomainError::validation(format!("retries out of range: {retries}")))?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = $2, retries = $3 WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.get())
        .bind(status.as_str())
        .bind(retries)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job_status", e))?;

        row.map(Job::try_from)
            .transpose()?
            .ok_or(RepositoryError::NotFound(id))
    }

    #[instrument(skip(self, log), fields(job_id = %log.job_id, level = %log.level), err)]
    async fn create_job_log(&self, log: NewJobLog) -> Result<JobLog, RepositoryError> {
        let row: JobLogRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO job_logs (job_id, level, message, stdout, stderr, exit_code)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(log.job_id.get())
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.stdout)
        .bind(&log.stderr)
        .bind(log.exit_code)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job_log", e))?;

        JobLog::try_from(row)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, RepositoryError> {
        let rows: Vec<JobLogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM job_logs WHERE job_id = $1 ORDER BY id ASC"
        ))
        .bind(job_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_job_logs", e))?;

        rows.into_iter().map(JobLog::try_from).collect()
    }
}

/// Database row for `jobs`.
#[derive(Debug)]
struct JobRow {
    id: i64,
    parent_job_id: Option<i64>,
    title: String,
    description: Option<String>,
    payload: serde_json::Value,
    status: String,
    retries: i32,
    max_retries: i32,
    timeout_seconds: Option<i32>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            parent_job_id: row.try_get("parent_job_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retries: row.try_get("retries")?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = RepositoryError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let counter = |name: &str, v: i32| {
            u32::try_from(v).map_err(|_| RepositoryError::Corrupt(format!("jobs.{name} = {v}")))
        };

        Ok(Job {
            id: JobId::new(row.id)?,
            parent_job_id: row.parent_job_id.map(JobId::new).transpose()?,
            title: row.title,
            description: row.description,
            payload: row.payload,
            status: row.status.parse()?,
            retries: counter("retries", row.retries)?,
            max_retries: counter("max_retries", row.max_retries)?,
            timeout_seconds: row.timeout_seconds,
            created_at: row.created_at,
        })
    }
}

/// Database row for `job_logs`.
#[derive(Debug)]
struct JobLogRow {
    id: i64,
    job_id: i64,
    level: String,
    message: String,
    stdout: Option<String>,
    stderr: Option<String>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobLogRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobLogRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            stdout: row.try_get("stdout")?,
            stderr: row.try_get("stderr")?,
            exit_code: row.try_get("exit_code")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobLogRow> for JobLog {
    type Error = RepositoryError;

    fn try_from(row: JobLogRow) -> Result<Self, Self::Error> {
        Ok(JobLog {
            id: row.id,
            job_id: JobId::new(row.job_id)?,
            level: row.level.parse()?,
            message: row.message,
            stdout: row.stdout,
            stderr: row.stderr,
            exit_code: row.exit_code,
            created_at: row.created_at,
        })
    }
}

/// Map SQLx errors to repository errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Foreign key / check constraint violations
                Some("23503") | Some("23514") => {
                    RepositoryError::Validation(DomainError::validation(msg))
                }
                _ => RepositoryError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

//! `relay-core`: job domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record and its status machine, audit log entries, and
//! the retry/backoff policy.

pub mod error;
pub mod id;
pub mod job;
pub mod log;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{DEFAULT_EXECUTION_TIMEOUT, Job, JobStatus, NewJob};
pub use log::{JobLog, LogLevel, NewJobLog};
pub use retry::{RetryDecision, backoff_for_attempt};

//! Polling consumer: scans the repository for `pending` jobs on an interval
//! and feeds them to the same processor.
//!
//! An alternative to the broker consumer (never run both). It also recovers
//! jobs whose retry requeue was lost to a crash. Jobs with a retry timer in
//! flight are deferred until their backoff elapses.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use relay_broker::BrokerError;
use relay_core::JobId;
use relay_infra::JobRepository;

use crate::processor::JobProcessor;
use crate::retry::Requeue;

/// Requeue target for polling mode: a deferred set the poller consults.
///
/// A retried job is deferred while its backoff runs; "requeueing" it just
/// makes it eligible for the next scan.
#[derive(Debug, Clone, Default)]
pub struct PollingRequeue {
    deferred: Arc<Mutex<HashSet<JobId>>>,
}

impl PollingRequeue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_deferred(&self, job_id: JobId) -> bool {
        self.deferred
            .lock()
            .map(|d| d.contains(&job_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Requeue for PollingRequeue {
    fn scheduled(&self, job_id: JobId) {
        if let Ok(mut deferred) = self.deferred.lock() {
            deferred.insert(job_id);
        }
    }

    async fn requeue(&self, job_id: JobId) -> Result<(), BrokerError> {
        if let Ok(mut deferred) = self.deferred.lock() {
            deferred.remove(&job_id);
        }
        Ok(())
    }
}

pub struct PollingConsumer {
    repo: Arc<dyn JobRepository>,
    processor: Arc<JobProcessor>,
    requeue: PollingRequeue,
    interval: Duration,
}

impl PollingConsumer {
    /// `requeue` must be the same instance the processor's retry scheduler
    /// was built with.
    pub fn new(
        repo: Arc<dyn JobRepository>,
        processor: Arc<JobProcessor>,
        requeue: PollingRequeue,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            processor,
            requeue,
            interval,
        }
    }

    /// Scan every `interval` until `shutdown` fires. Returns jobs dispatched.
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dispatched = 0u64;
        info!(interval_ms = self.interval.as_millis() as u64, "polling consumer started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => dispatched += self.poll_once(&shutdown).await as u64,
            }
        }

        info!(dispatched, "polling consumer stopped");
        dispatched
    }

    /// One scan: process every eligible pending job, oldest first.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> usize {
        let pending = match self.repo.list_pending_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list pending jobs");
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in pending {
            if shutdown.is_cancelled() {
                break;
            }
            if self.requeue.is_deferred(job.id) {
                debug!(job_id = %job.id, "retry backoff still running, deferring");
                continue;
            }
            self.processor.process(job.id).await;
            dispatched += 1;
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{JobStatus, NewJob};
    use relay_infra::{InMemoryJobRepository, InMemoryLockStore};
    use serde_json::json;

    use crate::executor::SimulatedBackend;
    use crate::lock::LockManager;
    use crate::processor::ProcessorConfig;
    use crate::retry::RetryScheduler;

    struct Harness {
        repo: Arc<InMemoryJobRepository>,
        scheduler: Arc<RetryScheduler>,
        consumer: PollingConsumer,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryJobRepository::new());
        let shutdown = CancellationToken::new();
        let requeue = PollingRequeue::new();
        let scheduler = Arc::new(RetryScheduler::new(
            repo.clone(),
            Arc::new(requeue.clone()),
            shutdown.clone(),
        ));
        let processor = Arc::new(JobProcessor::new(
            repo.clone(),
            LockManager::new(Arc::new(InMemoryLockStore::new()), "poller"),
            Arc::new(SimulatedBackend::new()),
            scheduler.clone(),
            ProcessorConfig::default(),
            shutdown.clone(),
        ));
        let consumer =
            PollingConsumer::new(repo.clone(), processor, requeue, Duration::from_secs(5));
        Harness {
            repo,
            scheduler,
            consumer,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scan_processes_pending_jobs() {
        let h = harness();
        let a = h.repo.create_job(NewJob::new("a", json!({ "sleep": 0 }))).await.unwrap();
        let b = h.repo.create_job(NewJob::new("b", json!({ "sleep": 0 }))).await.unwrap();

        assert_eq!(h.consumer.poll_once(&h.shutdown).await, 2);
        for id in [a.id, b.id] {
            let job = h.repo.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(h.consumer.poll_once(&h.shutdown).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_jobs_wait_for_backoff() {
        let h = harness();
        let job = h
            .repo
            .create_job(NewJob::new("flaky", json!({ "fail": true })).with_max_retries(1))
            .await
            .unwrap();

        assert_eq!(h.consumer.poll_once(&h.shutdown).await, 1);
        assert!(h.consumer.requeue.is_deferred(job.id));
        assert_eq!(h.consumer.poll_once(&h.shutdown).await, 0);

        h.scheduler.drain().await;
        assert!(!h.consumer.requeue.is_deferred(job.id));

        assert_eq!(h.consumer.poll_once(&h.shutdown).await, 1);
        let stored = h.repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert_eq!(stored.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let h = harness();
        h.repo.create_job(NewJob::new("a", json!({ "sleep": 0 }))).await.unwrap();

        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            shutdown.cancel();
        });
        assert_eq!(h.consumer.run(h.shutdown.clone()).await, 1);
    }
}

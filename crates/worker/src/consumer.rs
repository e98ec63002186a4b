//! Broker consumer loop.
//!
//! Pulls one message at a time and processes it to completion before reading
//! the next. Malformed messages are logged and discarded; every handled
//! delivery is acknowledged. Read errors pause for `read_error_backoff` and
//! the loop carries on until shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_broker::{Broker, BrokerError, Delivery};

use crate::processor::{JobProcessor, ProcessOutcome};

/// Counters for one consumer run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub processed: u64,
    pub malformed: u64,
    pub read_errors: u64,
}

pub struct Consumer {
    broker: Arc<dyn Broker>,
    processor: Arc<JobProcessor>,
    read_error_backoff: Duration,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, processor: Arc<JobProcessor>) -> Self {
        Self {
            broker,
            processor,
            read_error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_read_error_backoff(mut self, backoff: Duration) -> Self {
        self.read_error_backoff = backoff;
        self
    }

    /// Run until `shutdown` fires (or the broker closes).
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        info!("job consumer started");

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.broker.receive() => received,
            };

            match received {
                Ok(delivery) => {
                    stats.received += 1;
                    self.handle(delivery, &mut stats).await;
                }
                Err(_) if shutdown.is_cancelled() => break,
                Err(BrokerError::Closed) => {
                    warn!("broker closed, stopping consumer");
                    break;
                }
                Err(e) => {
                    stats.read_errors += 1;
                    error!(error = %e, "failed to read job message");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.read_error_backoff) => {}
                    }
                }
            }
        }

        info!(
            received = stats.received,
            processed = stats.processed,
            malformed = stats.malformed,
            read_errors = stats.read_errors,
            "job consumer stopped"
        );
        stats
    }

    async fn handle(&self, delivery: Delivery, stats: &mut ConsumerStats) {
        match delivery.job_id() {
            Ok(job_id) => {
                let outcome = self.processor.process(job_id).await;
                debug!(job_id = %job_id, outcome = ?outcome, "message handled");
                if outcome != ProcessOutcome::Aborted {
                    stats.processed += 1;
                }
            }
            Err(e) => {
                stats.malformed += 1;
                warn!(
                    payload = %delivery.payload_lossy(),
                    error = %e,
                    "discarding malformed job message"
                );
            }
        }

        if let Err(e) = self.broker.acknowledge(&delivery).await {
            warn!(receipt = %delivery.receipt, error = %e, "failed to acknowledge message");
        }
    }
}

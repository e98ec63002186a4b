//! Broker contract.

use std::sync::Arc;

use async_trait::async_trait;

use relay_core::{DomainError, JobId};

/// Broker error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("broker delivery could not be decoded: {0}")]
    Deserialization(String),

    #[error("broker closed")]
    Closed,
}

/// A message pulled from the broker.
///
/// `receipt` identifies the delivery to the broker for acknowledgement (a
/// stream entry id for Redis Streams, a sequence number in memory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(receipt: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            receipt: receipt.into(),
            payload: payload.into(),
        }
    }

    /// Decode the job id this message refers to.
    pub fn job_id(&self) -> Result<JobId, DomainError> {
        JobId::from_bytes(&self.payload)
    }

    /// Payload rendered for logs (lossy).
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// At-least-once job queue.
///
/// ## Delivery Guarantees
///
/// - A message may be delivered more than once (redelivery after a crash,
///   a retry requeue racing an external enqueue, ...)
/// - No ordering guarantee across jobs
/// - A delivery should be acknowledged once the consumer is done with it;
///   unacknowledged deliveries may come back
///
/// `receive` blocks until a message is available. It must be safe to drop
/// the returned future (the consumer races it against shutdown).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message referencing `job_id`.
    async fn publish(&self, job_id: JobId) -> Result<(), BrokerError>;

    /// Wait for the next message.
    async fn receive(&self) -> Result<Delivery, BrokerError>;

    /// Mark a delivery as handled.
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn publish(&self, job_id: JobId) -> Result<(), BrokerError> {
        (**self).publish(job_id).await
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        (**self).receive().await
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).acknowledge(delivery).await
    }
}

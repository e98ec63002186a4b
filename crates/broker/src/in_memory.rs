//! In-memory broker for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use relay_core::JobId;

use crate::bus::{Broker, BrokerError, Delivery};

/// In-memory job queue.
///
/// - Single logical consumer (receivers take turns on one channel)
/// - Keeps a history of every published payload so tests can assert on
///   requeues
/// - Acknowledgements are counted, nothing is redelivered
#[derive(Debug)]
pub struct InMemoryBroker {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    history: Mutex<Vec<Vec<u8>>>,
    next_receipt: AtomicU64,
    acknowledged: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            history: Mutex::new(Vec::new()),
            next_receipt: AtomicU64::new(1),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Enqueue an arbitrary payload, as an external producer would.
    pub fn publish_raw(&self, payload: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        let payload = payload.into();
        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst).to_string();

        if let Ok(mut history) = self.history.lock() {
            history.push(payload.clone());
        }

        self.tx
            .send(Delivery::new(receipt, payload))
            .map_err(|_| BrokerError::Closed)
    }

    /// Every payload published so far, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Job ids published so far (malformed payloads skipped).
    pub fn published_ids(&self) -> Vec<JobId> {
        self.published()
            .iter()
            .filter_map(|p| JobId::from_bytes(p).ok())
            .collect()
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.publish_raw(job_id.to_bytes())
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(BrokerError::Closed)
    }

    async fn acknowledge(&self, _delivery: &Delivery) -> Result<(), BrokerError> {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive_in_order() {
        let broker = InMemoryBroker::new();
        broker.publish(JobId::new(1).unwrap()).await.unwrap();
        broker.publish(JobId::new(2).unwrap()).await.unwrap();

        let first = broker.receive().await.unwrap();
        let second = broker.receive().await.unwrap();
        assert_eq!(first.job_id().unwrap().get(), 1);
        assert_eq!(second.job_id().unwrap().get(), 2);
        assert_ne!(first.receipt, second.receipt);
    }

    #[tokio::test]
    async fn history_keeps_raw_payloads() {
        let broker = InMemoryBroker::new();
        broker.publish_raw("not-a-number").unwrap();
        broker.publish(JobId::new(9).unwrap()).await.unwrap();

        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.published_ids(), vec![JobId::new(9).unwrap()]);

        let bad = broker.receive().await.unwrap();
        assert!(bad.job_id().is_err());
        assert_eq!(bad.payload_lossy(), "not-a-number");
    }

    #[tokio::test]
    async fn acknowledgements_are_counted() {
        let broker = InMemoryBroker::new();
        broker.publish(JobId::new(3).unwrap()).await.unwrap();
        let d = broker.receive().await.unwrap();
        broker.acknowledge(&d).await.unwrap();
        assert_eq!(broker.acknowledged(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_a_message() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive().await })
        };

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        broker.publish(JobId::new(5).unwrap()).await.unwrap();
        let d = waiter.await.unwrap().unwrap();
        assert_eq!(d.job_id().unwrap().get(), 5);
    }
}

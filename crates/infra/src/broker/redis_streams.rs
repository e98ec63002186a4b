//! Redis Streams-backed job broker (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD <stream> * job_id <id>`
//! - **Receive**: `XREADGROUP GROUP <group> <consumer>`; this consumer's
//!   pending entries list (deliveries it never acknowledged, e.g. before a
//!   crash) is drained first, then new entries are read with `>`
//! - **Acknowledge**: `XACK <stream> <group> <entry id>`
//!
//! Blocking reads run on their own connection so publishes and acks are
//! never stuck behind a `BLOCK`.
//!
//! Dropping a `receive` future while `XREADGROUP >` is in flight can leave
//! the entry in this consumer's pending list; it is picked up by the pending
//! drain on the next start.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use relay_broker::{Broker, BrokerError, Delivery};
use relay_core::JobId;

/// Stream field carrying the job id.
const JOB_ID_FIELD: &str = "job_id";

/// Default `BLOCK` for new-entry reads.
const DEFAULT_READ_BLOCK: Duration = Duration::from_secs(1);

struct ReaderState {
    conn: MultiplexedConnection,
    /// Next id to read from the pending entries list; `None` once drained.
    pending_cursor: Option<String>,
}

pub struct RedisStreamsBroker {
    writer: MultiplexedConnection,
    reader: Mutex<ReaderState>,
    stream_key: String,
    group: String,
    consumer: String,
    read_block: Duration,
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("read_block", &self.read_block)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBroker {
    /// Connect and make sure the consumer group exists.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream holding job messages
    /// * `group` - consumer group shared by all workers
    /// * `consumer` - this worker's name inside the group
    pub async fn connect(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let writer = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let reader = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let broker = Self {
            writer,
            reader: Mutex::new(ReaderState {
                conn: reader,
                pending_cursor: Some("0".to_string()),
            }),
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: consumer.into(),
            read_block: DEFAULT_READ_BLOCK,
        };
        broker.ensure_consumer_group().await?;
        Ok(broker)
    }

    /// Override how long a single new-entry read blocks.
    pub fn with_read_block(mut self, read_block: Duration) -> Self {
        self.read_block = read_block;
        self
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// New groups start at the end of the stream (`$`); `MKSTREAM` creates
    /// the stream when missing.
    pub async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.writer.clone();
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    /// One `XREADGROUP` call for a single entry starting after `id`.
    async fn read_one(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer).arg("COUNT").arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK")
                .arg(u64::try_from(block.as_millis()).unwrap_or(u64::MAX));
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(id);

        // Nil reply when BLOCK elapses with nothing new.
        let reply: Option<StreamReadReply> = cmd
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {}", e)))?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        Ok(entry.map(|entry| {
            // Trimmed entries come back with no fields; an empty payload is
            // rejected as malformed by the consumer and acknowledged.
            let payload: Vec<u8> = entry.get(JOB_ID_FIELD).unwrap_or_default();
            Delivery::new(entry.id, payload)
        }))
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self), fields(stream_key = %self.stream_key, job_id = %job_id), err)]
    async fn publish(&self, job_id: JobId) -> Result<(), BrokerError> {
        let mut conn = self.writer.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(JOB_ID_FIELD)
            .arg(job_id.to_bytes())
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {}", e)))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        let mut state = self.reader.lock().await;
        let ReaderState {
            conn,
            pending_cursor,
        } = &mut *state;

        if let Some(cursor) = pending_cursor.clone() {
            match self.read_one(conn, &cursor, None).await? {
                Some(delivery) => {
                    debug!(receipt = %delivery.receipt, "redelivering pending stream entry");
                    *pending_cursor = Some(delivery.receipt.clone());
                    return Ok(delivery);
                }
                None => *pending_cursor = None,
            }
        }

        loop {
            if let Some(delivery) = self.read_one(conn, ">", Some(self.read_block)).await? {
                return Ok(delivery);
            }
        }
    }

    #[instrument(skip(self, delivery), fields(receipt = %delivery.receipt), err)]
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.writer.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }
}

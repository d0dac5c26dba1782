pub mod publisher;

use crate::models::Envelope;
use async_trait::async_trait;
use redis::{
    AsyncCommands,
    aio::MultiplexedConnection,
    streams::{StreamMaxlen, StreamReadOptions, StreamReadReply},
};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info};

pub use publisher::{Publisher, PublisherConfig};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publisher is closed")]
    Closed,
}

/// One message handed to a consumer. `payload` is `None` when the entry
/// was trimmed before it could be re-read.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub payload: Option<String>,
}

/// Durable at-least-once channel, sharded by ordering key.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    fn shard_count(&self) -> usize;

    async fn publish(&self, batch: &[Envelope]) -> Result<(), QueueError>;

    /// Up to `max` deliveries; unacknowledged ones come back after `rewind`.
    async fn pull(&self, shard: usize, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, shard: usize, ids: &[String]) -> Result<(), QueueError>;

    async fn rewind(&self, shard: usize);
}

/// FNV-1a, stable across processes and releases.
pub fn shard_for(key: &str, shards: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % shards.max(1) as u64) as usize
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub namespace: String,
    pub shards: usize,
    pub group: String,
    pub consumer: String,
    pub max_len: usize,
}

/// Redis Streams backend: one stream per shard, one consumer group.
pub struct RedisStreams {
    conn: MultiplexedConnection,
    config: StreamConfig,
    backlog: Vec<AtomicBool>,
}

impl RedisStreams {
    pub async fn connect(client: &redis::Client, config: StreamConfig) -> Result<Self, QueueError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let shards = config.shards.max(1);
        for shard in 0..shards {
            let key = stream_key(&config.namespace, shard);
            let created: redis::RedisResult<()> = conn
                .xgroup_create_mkstream(&key, &config.group, "0")
                .await;
            match created {
                Ok(()) => info!(target = "harvester.consume", stream = %key, group = %config.group, "consumer_group_created"),
                Err(err) if err.code() == Some("BUSYGROUP") => {}
                Err(err) => return Err(err.into()),
            }
        }
        let backlog = (0..shards).map(|_| AtomicBool::new(true)).collect();
        Ok(Self {
            conn,
            config: StreamConfig { shards, ..config },
            backlog,
        })
    }

    fn key(&self, shard: usize) -> String {
        stream_key(&self.config.namespace, shard)
    }

    async fn read(&self, shard: usize, from: &str, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let key = self.key(shard);
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max);
        let reply: StreamReadReply = conn.xread_options(&[&key], &[from], &options).await?;
        Ok(reply
            .keys
            .into_iter()
            .flat_map(|stream| stream.ids)
            .map(|entry| Delivery {
                payload: entry.get::<String>("payload"),
                id: entry.id,
            })
            .collect())
    }
}

fn stream_key(namespace: &str, shard: usize) -> String {
    format!("{namespace}:items:{shard}")
}

#[async_trait]
impl MessageBus for RedisStreams {
    fn shard_count(&self) -> usize {
        self.config.shards
    }

    async fn publish(&self, batch: &[Envelope]) -> Result<(), QueueError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for envelope in batch {
            let key = self.key(shard_for(&envelope.ordering_key, self.config.shards));
            pipe.xadd_maxlen(
                key,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                &[
                    ("id", envelope.id.as_str()),
                    ("key", envelope.ordering_key.as_str()),
                    ("payload", envelope.payload.as_str()),
                ],
            )
            .ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn pull(&self, shard: usize, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let Some(flag) = self.backlog.get(shard) else {
            return Ok(Vec::new());
        };
        if flag.load(Ordering::Acquire) {
            let pending = self.read(shard, "0", max).await?;
            if !pending.is_empty() {
                debug!(target = "harvester.consume", shard, count = pending.len(), "backlog_redelivered");
                return Ok(pending);
            }
            flag.store(false, Ordering::Release);
        }
        self.read(shard, ">", max).await
    }

    async fn ack(&self, shard: usize, ids: &[String]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(self.key(shard), &self.config.group, ids).await?;
        Ok(())
    }

    async fn rewind(&self, shard: usize) {
        if let Some(flag) = self.backlog.get(shard) {
            flag.store(true, Ordering::Release);
        }
    }
}

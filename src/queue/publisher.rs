use crate::marketplace::RetryPolicy;
use crate::models::{Envelope, Item};
use crate::queue::{MessageBus, QueueError};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep, timeout_at},
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub linger: Duration,
    pub capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            linger: Duration::from_millis(200),
            capacity: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub failed: u64,
    pub batches: u64,
}

/// Handle onto the bounded publish queue. Cloned by every harvest worker;
/// when the last clone is dropped the background task flushes and stops.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Envelope>,
}

impl Publisher {
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        config: PublisherConfig,
    ) -> (Self, JoinHandle<PublishStats>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let handle = tokio::spawn(flush_loop(bus, config, rx));
        (Self { tx }, handle)
    }

    /// Waits for queue space when the flush task is behind.
    pub async fn publish(&self, item: &Item) -> Result<(), QueueError> {
        let envelope = Envelope::from_item(item)?;
        self.tx.send(envelope).await.map_err(|_| QueueError::Closed)
    }
}

async fn flush_loop(
    bus: Arc<dyn MessageBus>,
    config: PublisherConfig,
    mut rx: mpsc::Receiver<Envelope>,
) -> PublishStats {
    let batch_size = config.batch_size.max(1);
    let mut stats = PublishStats::default();
    let mut batch: Vec<Envelope> = Vec::with_capacity(batch_size);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        let deadline = Instant::now() + config.linger;
        while batch.len() < batch_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(envelope)) => batch.push(envelope),
                Ok(None) | Err(_) => break,
            }
        }
        send_with_retry(bus.as_ref(), &config.retry, &batch, &mut stats).await;
        batch.clear();
    }

    debug!(
        target = "harvester.publish",
        published = stats.published,
        failed = stats.failed,
        batches = stats.batches,
        "publisher_stopped"
    );
    stats
}

async fn send_with_retry(
    bus: &dyn MessageBus,
    retry: &RetryPolicy,
    batch: &[Envelope],
    stats: &mut PublishStats,
) {
    stats.batches += 1;
    let mut attempt = 0u32;
    loop {
        match bus.publish(batch).await {
            Ok(()) => {
                stats.published += batch.len() as u64;
                crate::metrics::items_published(batch.len());
                return;
            }
            Err(err) if attempt + 1 < retry.max_attempts => {
                attempt += 1;
                let delay = retry.backoff(attempt);
                warn!(
                    target = "harvester.publish",
                    attempt,
                    batch = batch.len(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "publish_retry"
                );
                sleep(delay).await;
            }
            Err(err) => {
                stats.failed += batch.len() as u64;
                crate::metrics::publish_failures(batch.len());
                error!(
                    target = "harvester.publish",
                    batch = batch.len(),
                    first_key = batch.first().map(|e| e.ordering_key.as_str()).unwrap_or(""),
                    error = %err,
                    "publish_failed"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBus, sample_item};

    fn config(batch_size: usize) -> PublisherConfig {
        PublisherConfig {
            batch_size,
            linger: Duration::from_millis(20),
            capacity: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[tokio::test]
    async fn drops_flush_everything_in_batches() {
        let bus = Arc::new(MemoryBus::new(2));
        let (publisher, handle) = Publisher::spawn(bus.clone(), config(3));
        for i in 0..7 {
            publisher
                .publish(&sample_item(&format!("rakuten:{i}"), &format!("Desk {i}")))
                .await
                .expect("queued");
        }
        drop(publisher);
        let stats = handle.await.expect("flush task");
        assert_eq!(stats.published, 7);
        assert_eq!(stats.failed, 0);
        assert!(stats.batches >= 3);
        assert_eq!(bus.len(), 7);
    }

    #[tokio::test]
    async fn same_key_keeps_publish_order() {
        let bus = Arc::new(MemoryBus::new(4));
        let (publisher, handle) = Publisher::spawn(bus.clone(), config(2));
        for price in [100, 200, 300] {
            let mut item = sample_item("yahoo:shelf", "Walnut Shelf");
            item.price = price;
            publisher.publish(&item).await.expect("queued");
        }
        drop(publisher);
        handle.await.expect("flush task");

        let shard = crate::queue::shard_for("Walnut Shelf", 4);
        let prices: Vec<i64> = bus
            .drain(shard)
            .iter()
            .map(|envelope| envelope.decode().expect("item").price)
            .collect();
        assert_eq!(prices, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn transient_bus_failures_are_retried() {
        let bus = Arc::new(MemoryBus::new(1));
        bus.fail_next_publishes(2);
        let (publisher, handle) = Publisher::spawn(bus.clone(), config(10));
        publisher
            .publish(&sample_item("rakuten:1", "Desk"))
            .await
            .expect("queued");
        drop(publisher);
        let stats = handle.await.expect("flush task");
        assert_eq!(stats.published, 1);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn persistent_failures_are_counted_not_hidden() {
        let bus = Arc::new(MemoryBus::new(1));
        bus.fail_next_publishes(10);
        let (publisher, handle) = Publisher::spawn(bus.clone(), config(10));
        publisher
            .publish(&sample_item("rakuten:1", "Desk"))
            .await
            .expect("queued");
        drop(publisher);
        let stats = handle.await.expect("flush task");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.published, 0);
        assert_eq!(bus.len(), 0);
    }
}

use crate::marketplace::RetryPolicy;
use crate::models::Item;
use crate::queue::{Delivery, MessageBus};
use crate::store::{DualSinkWriter, WriteSummary};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// One delivery is dropped; the rest of the batch proceeds.
    ItemRejected,
    /// The batch is not acknowledged and will be redelivered.
    BatchFatal,
}

impl PipelineError {
    pub fn item_rejected(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::ItemRejected,
        }
    }

    pub fn batch_fatal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::BatchFatal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub idle_wait: Duration,
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_wait: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub decoded: usize,
    pub undecodable: usize,
    /// Deliveries superseded by a later one for the same unique id.
    pub duplicates: usize,
    pub written: WriteSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub committed: u64,
    pub failed: u64,
}

/// Batch consumer: pulls one shard, turns deliveries into items and hands
/// them to the dual-sink writer.
pub struct IngestPipeline {
    bus: Arc<dyn MessageBus>,
    writer: Arc<DualSinkWriter>,
    config: IngestConfig,
}

fn decode(delivery: &Delivery) -> Result<Item, PipelineError> {
    let payload = delivery
        .payload
        .as_deref()
        .ok_or_else(|| PipelineError::item_rejected("decode", "entry has no payload"))?;
    serde_json::from_str(payload).map_err(|err| PipelineError::item_rejected("decode", err.to_string()))
}

impl IngestPipeline {
    pub fn new(bus: Arc<dyn MessageBus>, writer: Arc<DualSinkWriter>, config: IngestConfig) -> Self {
        Self { bus, writer, config }
    }

    /// Decodes, drops the marketplace category label, collapses repeated
    /// ids to their last delivery and writes the batch.
    pub async fn process(&self, deliveries: &[Delivery]) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport {
            received: deliveries.len(),
            ..BatchReport::default()
        };
        if deliveries.is_empty() {
            return Ok(report);
        }

        let mut items: Vec<Item> = Vec::with_capacity(deliveries.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for delivery in deliveries {
            let mut item = match decode(delivery) {
                Ok(item) => item,
                Err(err) => {
                    report.undecodable += 1;
                    warn!(
                        target = "harvester.consume",
                        delivery_id = %delivery.id,
                        stage = err.stage(),
                        error = %err.detail(),
                        "delivery_rejected"
                    );
                    continue;
                }
            };
            report.decoded += 1;
            item.category_name = None;
            match positions.get(&item.id) {
                Some(&pos) => {
                    items[pos] = item;
                    report.duplicates += 1;
                }
                None => {
                    positions.insert(item.id.clone(), items.len());
                    items.push(item);
                }
            }
        }

        if items.is_empty() {
            return Err(PipelineError::batch_fatal(
                "decode",
                format!("none of {} deliveries could be decoded", report.received),
            ));
        }

        report.written = self
            .writer
            .write(items)
            .await
            .map_err(|err| PipelineError::batch_fatal("write", err.to_string()))?;
        Ok(report)
    }

    /// Consumes one shard until cancelled. A committed batch is acked; a
    /// failed one is rewound and retried after backoff. An in-flight batch
    /// always finishes before the loop observes cancellation.
    pub async fn run_shard(&self, shard: usize, cancel: CancellationToken) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut consecutive_failures = 0u32;
        info!(target = "harvester.consume", shard, "consumer_started");

        loop {
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pulled = self.bus.pull(shard, self.config.batch_size.max(1)) => pulled,
            };
            let deliveries = match pulled {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(target = "harvester.consume", shard, error = %err, "pull_failed");
                    if !pause(&cancel, self.config.retry.backoff(consecutive_failures)).await {
                        break;
                    }
                    continue;
                }
            };
            if deliveries.is_empty() {
                if !pause(&cancel, self.config.idle_wait).await {
                    break;
                }
                continue;
            }

            match self.process(&deliveries).await {
                Ok(report) => {
                    let ids: Vec<String> = deliveries.into_iter().map(|d| d.id).collect();
                    if let Err(err) = self.bus.ack(shard, &ids).await {
                        warn!(target = "harvester.consume", shard, error = %err, "ack_failed");
                    }
                    consecutive_failures = 0;
                    stats.committed += 1;
                    crate::metrics::batch_outcome("committed");
                    debug!(
                        target = "harvester.consume",
                        shard,
                        received = report.received,
                        undecodable = report.undecodable,
                        duplicates = report.duplicates,
                        rows = report.written.rows,
                        indexed = report.written.indexed,
                        deleted = report.written.deleted,
                        "batch_committed"
                    );
                }
                Err(err) => {
                    consecutive_failures += 1;
                    stats.failed += 1;
                    crate::metrics::batch_outcome("failed");
                    let delay = self.config.retry.backoff(consecutive_failures);
                    error!(
                        target = "harvester.consume",
                        shard,
                        stage = err.stage(),
                        deliveries = deliveries.len(),
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.detail(),
                        "batch_failed"
                    );
                    self.bus.rewind(shard).await;
                    if !pause(&cancel, delay).await {
                        break;
                    }
                }
            }
        }

        info!(
            target = "harvester.consume",
            shard,
            committed = stats.committed,
            failed = stats.failed,
            "consumer_stopped"
        );
        stats
    }

    /// One consumer task per shard.
    pub fn spawn_consumers(self: &Arc<Self>, cancel: &CancellationToken) -> JoinSet<ConsumerStats> {
        let mut consumers = JoinSet::new();
        for shard in 0..self.bus.shard_count() {
            let pipeline = Arc::clone(self);
            let cancel = cancel.clone();
            consumers.spawn(async move { pipeline.run_shard(shard, cancel).await });
        }
        consumers
    }
}

/// Sleeps unless cancelled first; `false` means stop.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

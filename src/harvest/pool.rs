use crate::harvest::cursor::PriceCursor;
use crate::marketplace::{FetchError, Marketplace, RawListing};
use crate::models::Platform;
use crate::queue::Publisher;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PriceBounds {
    pub min_price: i64,
    pub max_price: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CategoryFailure {
    pub category_id: i64,
    pub error: String,
}

/// Outcome of one pool run. Every dispatched category ends up in exactly
/// one of `completed`, `failed` or `cancelled`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HarvestReport {
    pub platform: Platform,
    pub dispatched: usize,
    pub completed: usize,
    pub cancelled: usize,
    /// Never dispatched because the run was stopped first.
    pub skipped: usize,
    pub failed: Vec<CategoryFailure>,
    /// Handed to the publisher. Confirmed stream writes and dropped
    /// batches are counted in `PublishStats`.
    pub items_enqueued: u64,
    pub items_rejected: u64,
}

impl HarvestReport {
    fn empty(platform: Platform) -> Self {
        Self {
            platform,
            dispatched: 0,
            completed: 0,
            cancelled: 0,
            skipped: 0,
            failed: Vec::new(),
            items_enqueued: 0,
            items_rejected: 0,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.completed + self.failed.len() + self.cancelled == self.dispatched
    }
}

#[derive(Debug)]
enum CategoryOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
struct CategoryResult {
    category_id: i64,
    outcome: CategoryOutcome,
    enqueued: u64,
    rejected: u64,
}

/// One worker per credential. Idle workers announce themselves on a shared
/// channel; the dispatcher hands each one category at a time.
pub struct WorkerPool<M: Marketplace> {
    source: Arc<M>,
    publisher: Publisher,
    bounds: PriceBounds,
}

impl<M: Marketplace> WorkerPool<M> {
    pub fn new(source: Arc<M>, publisher: Publisher, bounds: PriceBounds) -> Self {
        Self {
            source,
            publisher,
            bounds,
        }
    }

    /// Processes every category once, ascending by id. Returns when all
    /// dispatched categories are accounted for.
    pub async fn run(&self, categories: Vec<i64>, cancel: CancellationToken) -> HarvestReport {
        let platform = self.source.platform();
        let categories: Vec<i64> = categories.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut report = HarvestReport::empty(platform);

        let size = self.source.workers();
        if size == 0 {
            warn!(target = "harvester.pool", platform = platform.as_str(), "no_usable_credentials");
            report.skipped = categories.len();
            return report;
        }

        // Cancelled by the caller, or internally once every credential is spent.
        let stop = cancel.child_token();
        let (idle_tx, mut idle_rx) = mpsc::channel::<usize>(size);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<CategoryResult>();
        let mut mailboxes = Vec::with_capacity(size);
        let mut workers = JoinSet::new();

        for worker in 0..size {
            let (mail_tx, mail_rx) = mpsc::channel::<i64>(1);
            mailboxes.push(mail_tx);
            workers.spawn(worker_loop(
                worker,
                self.source.clone(),
                self.publisher.clone(),
                self.bounds,
                stop.clone(),
                idle_tx.clone(),
                mail_rx,
                result_tx.clone(),
            ));
        }
        drop(idle_tx);
        drop(result_tx);

        info!(
            target = "harvester.pool",
            platform = platform.as_str(),
            workers = size,
            categories = categories.len(),
            "harvest_dispatch_started"
        );

        let mut dispatched: Vec<i64> = Vec::with_capacity(categories.len());
        for category_id in &categories {
            let worker = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                idle = idle_rx.recv() => match idle {
                    Some(worker) => worker,
                    None => break,
                },
            };
            if mailboxes[worker].send(*category_id).await.is_ok() {
                dispatched.push(*category_id);
            } else {
                report.failed.push(CategoryFailure {
                    category_id: *category_id,
                    error: "worker terminated".into(),
                });
                report.dispatched += 1;
            }
        }
        report.skipped = categories.len() - dispatched.len() - report.failed.len();
        report.dispatched += dispatched.len();
        drop(mailboxes);

        let mut pending: HashSet<i64> = dispatched.iter().copied().collect();
        while let Some(result) = result_rx.recv().await {
            pending.remove(&result.category_id);
            report.items_enqueued += result.enqueued;
            report.items_rejected += result.rejected;
            match result.outcome {
                CategoryOutcome::Completed => report.completed += 1,
                CategoryOutcome::Cancelled => report.cancelled += 1,
                CategoryOutcome::Failed(error) => report.failed.push(CategoryFailure {
                    category_id: result.category_id,
                    error,
                }),
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(target = "harvester.pool", platform = platform.as_str(), error = %err, "worker_panicked");
            }
        }
        let mut lost: Vec<i64> = pending.into_iter().collect();
        lost.sort_unstable();
        for category_id in lost {
            report.failed.push(CategoryFailure {
                category_id,
                error: "worker terminated".into(),
            });
        }
        report.failed.sort_by_key(|failure| failure.category_id);

        info!(
            target = "harvester.pool",
            platform = platform.as_str(),
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed.len(),
            cancelled = report.cancelled,
            skipped = report.skipped,
            items_enqueued = report.items_enqueued,
            items_rejected = report.items_rejected,
            "harvest_finished"
        );
        report
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<M: Marketplace>(
    worker: usize,
    source: Arc<M>,
    publisher: Publisher,
    bounds: PriceBounds,
    stop: CancellationToken,
    idle_tx: mpsc::Sender<usize>,
    mut mailbox: mpsc::Receiver<i64>,
    results: mpsc::UnboundedSender<CategoryResult>,
) {
    loop {
        if idle_tx.send(worker).await.is_err() {
            return;
        }
        let Some(category_id) = mailbox.recv().await else {
            return;
        };
        let result = drain_category(worker, source.as_ref(), &publisher, bounds, &stop, category_id).await;
        if results.send(result).is_err() {
            return;
        }
    }
}

async fn drain_category<M: Marketplace>(
    worker: usize,
    source: &M,
    publisher: &Publisher,
    bounds: PriceBounds,
    stop: &CancellationToken,
    category_id: i64,
) -> CategoryResult {
    let platform = source.platform();
    let started = Instant::now();
    let mut cursor = PriceCursor::new(source, worker, category_id, bounds.min_price, bounds.max_price);
    let mut result = CategoryResult {
        category_id,
        outcome: CategoryOutcome::Completed,
        enqueued: 0,
        rejected: 0,
    };

    loop {
        if stop.is_cancelled() {
            result.outcome = CategoryOutcome::Cancelled;
            debug!(target = "harvester.pool", platform = platform.as_str(), category_id, "category_abandoned");
            return result;
        }
        let (raws, done) = match cursor.next().await {
            Ok(page) => page,
            Err(err) => {
                if err == FetchError::AllCredentialsExhausted {
                    stop.cancel();
                }
                warn!(
                    target = "harvester.pool",
                    platform = platform.as_str(),
                    category_id,
                    floor = cursor.state().current_min_price,
                    page = cursor.state().current_page,
                    error = %err,
                    "category_failed"
                );
                result.outcome = CategoryOutcome::Failed(err.to_string());
                return result;
            }
        };

        let mut rejected = 0usize;
        for raw in raws {
            let source_id = raw.source_id().to_string();
            match source.normalize(raw, category_id) {
                Ok(item) => {
                    if let Err(err) = publisher.publish(&item).await {
                        result.outcome = CategoryOutcome::Failed(err.to_string());
                        return result;
                    }
                    result.enqueued += 1;
                }
                Err(err) => {
                    rejected += 1;
                    warn!(
                        target = "harvester.normalize",
                        platform = platform.as_str(),
                        category_id,
                        source_id = %source_id,
                        error = %err,
                        "item_rejected"
                    );
                }
            }
        }
        if rejected > 0 {
            result.rejected += rejected as u64;
            crate::metrics::items_rejected(platform, rejected);
        }
        if done {
            break;
        }
    }

    crate::metrics::category_elapsed(platform, started.elapsed());
    debug!(
        target = "harvester.pool",
        platform = platform.as_str(),
        worker,
        category_id,
        enqueued = result.enqueued,
        rejected = result.rejected,
        "category_drained"
    );
    result
}

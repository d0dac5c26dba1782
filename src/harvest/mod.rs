pub mod cursor;
pub mod pool;

use crate::marketplace::Marketplace;
use crate::models::Platform;
use crate::queue::Publisher;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use pool::{CategoryFailure, HarvestReport, PriceBounds, WorkerPool};

/// Object-safe view of a harvester so jobs can hold every platform in one map.
#[async_trait]
pub trait Harvest: Send + Sync {
    fn platform(&self) -> Platform;

    /// Crawls every harvest category with id `>= start_category_id`.
    async fn run(&self, start_category_id: Option<i64>, cancel: CancellationToken) -> HarvestReport;
}

pub struct Harvester<M: Marketplace> {
    source: Arc<M>,
    pool: WorkerPool<M>,
}

impl<M: Marketplace> Harvester<M> {
    pub fn new(source: Arc<M>, publisher: Publisher, bounds: PriceBounds) -> Self {
        let pool = WorkerPool::new(source.clone(), publisher, bounds);
        Self { source, pool }
    }

    /// Ascending, deduplicated categories from `start` on.
    pub fn plan(&self, start_category_id: Option<i64>) -> Vec<i64> {
        let mut categories = self.source.harvest_categories();
        categories.sort_unstable();
        categories.dedup();
        if let Some(start) = start_category_id {
            categories.retain(|id| *id >= start);
        }
        categories
    }
}

#[async_trait]
impl<M: Marketplace> Harvest for Harvester<M> {
    fn platform(&self) -> Platform {
        self.source.platform()
    }

    async fn run(&self, start_category_id: Option<i64>, cancel: CancellationToken) -> HarvestReport {
        let categories = self.plan(start_category_id);
        info!(
            target = "harvester.pool",
            platform = self.source.platform().as_str(),
            start_category_id = ?start_category_id,
            categories = categories.len(),
            "harvest_started"
        );
        self.pool.run(categories, cancel).await
    }
}

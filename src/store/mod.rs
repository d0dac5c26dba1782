pub mod rows;
pub mod search;

use crate::models::Item;
use crate::resolver::{ResolveError, Resolver};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, error};

pub use rows::{RowStoreConfig, SupabaseRowStore};
pub use search::{HttpSearchIndex, SearchConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

fn render_failures(failures: &[BulkFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({}: {})", f.id, f.status, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("{} document(s) failed: {}", .0.len(), render_failures(.0))]
    Bulk(Vec<BulkFailure>),
}

pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(500)
        .collect();
    Err(SinkError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Indexed item as seen by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Candidate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub jan_code: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Items in `category_id` whose name matches `name`, best first.
    async fn candidates(
        &self,
        category_id: i64,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, SinkError>;

    /// Indexes active items and deletes inactive ones.
    async fn bulk_write(&self, items: &[Item]) -> Result<(), SinkError>;
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Group ids already assigned to the given unique ids.
    async fn find_groups(&self, ids: &[String]) -> Result<HashMap<String, String>, SinkError>;

    /// Insert-or-update keyed by unique id.
    async fn upsert(&self, items: &[Item]) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("group resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("row store: {0}")]
    Rows(SinkError),
    #[error("search index: {0}")]
    Search(SinkError),
    #[error("row store: {rows}; search index: {search}")]
    Both { rows: SinkError, search: SinkError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: usize,
    pub indexed: usize,
    pub deleted: usize,
}

/// Resolves group ids, then writes both sinks concurrently. The two writes
/// are independent; a failure in either fails the batch.
pub struct DualSinkWriter {
    rows: Arc<dyn RowStore>,
    search: Arc<dyn SearchIndex>,
    resolver: Arc<Resolver>,
}

impl DualSinkWriter {
    pub fn new(rows: Arc<dyn RowStore>, search: Arc<dyn SearchIndex>, resolver: Arc<Resolver>) -> Self {
        Self {
            rows,
            search,
            resolver,
        }
    }

    pub async fn write(&self, mut items: Vec<Item>) -> Result<WriteSummary, WriteError> {
        if items.is_empty() {
            return Ok(WriteSummary::default());
        }
        self.resolver.assign_groups(&mut items).await?;

        let (rows, search) = tokio::join!(self.rows.upsert(&items), self.search.bulk_write(&items));
        match (rows, search) {
            (Ok(()), Ok(())) => {
                let indexed = items.iter().filter(|item| item.is_active()).count();
                let summary = WriteSummary {
                    rows: items.len(),
                    indexed,
                    deleted: items.len() - indexed,
                };
                debug!(
                    target = "harvester.sink",
                    rows = summary.rows,
                    indexed = summary.indexed,
                    deleted = summary.deleted,
                    "batch_written"
                );
                Ok(summary)
            }
            (Err(rows), Ok(())) => {
                error!(target = "harvester.sink", sink = "rows", error = %rows, "sink_failed");
                Err(WriteError::Rows(rows))
            }
            (Ok(()), Err(search)) => {
                error!(target = "harvester.sink", sink = "search", error = %search, "sink_failed");
                Err(WriteError::Search(search))
            }
            (Err(rows), Err(search)) => {
                error!(target = "harvester.sink", rows = %rows, search = %search, "sink_failed");
                Err(WriteError::Both { rows, search })
            }
        }
    }
}

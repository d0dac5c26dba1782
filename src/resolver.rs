use crate::images::{ImageHasher, PerceptualHash};
use crate::models::Item;
use crate::store::{Candidate, RowStore, SearchIndex, SinkError};
use futures::{StreamExt, stream};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("row store lookup failed: {0}")]
    Lookup(SinkError),
    #[error("candidate search failed: {0}")]
    Search(SinkError),
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Top-K candidates fetched from the search index.
    pub candidates: usize,
    /// Largest Hamming distance still treated as the same picture.
    pub max_distance: u32,
    /// Items resolved concurrently per batch.
    pub concurrency: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            candidates: 10,
            max_distance: 10,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Existing,
    ProductCode,
    Name,
    Image,
    Minted,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::Existing => "existing",
            MatchRule::ProductCode => "product_code",
            MatchRule::Name => "name",
            MatchRule::Image => "image",
            MatchRule::Minted => "minted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub group_id: String,
    pub rule: MatchRule,
}

impl Resolution {
    fn matched(group_id: &str, rule: MatchRule) -> Self {
        Self {
            group_id: group_id.to_string(),
            rule,
        }
    }
}

/// Finds or mints the cross-marketplace group of an item.
///
/// Cascade: existing row, then among same-category name-search candidates
/// an equal product code, an equal name, and finally a close first image.
/// Concurrent first sightings of one product may mint two groups; a later
/// batch sees the indexed item and converges.
pub struct Resolver {
    rows: Arc<dyn RowStore>,
    search: Arc<dyn SearchIndex>,
    hasher: Arc<dyn ImageHasher>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(
        rows: Arc<dyn RowStore>,
        search: Arc<dyn SearchIndex>,
        hasher: Arc<dyn ImageHasher>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            rows,
            search,
            hasher,
            config,
        }
    }

    pub async fn resolve_group(&self, item: &Item) -> Result<Resolution, ResolveError> {
        let existing = self
            .rows
            .find_groups(std::slice::from_ref(&item.id))
            .await
            .map_err(ResolveError::Lookup)?;
        if let Some(group_id) = existing.get(&item.id) {
            return Ok(Resolution::matched(group_id, MatchRule::Existing));
        }
        self.match_or_mint(item).await
    }

    /// Sets `group_id` on every item. Existing rows are looked up in one
    /// call; the rest fan out with bounded concurrency.
    pub async fn assign_groups(&self, items: &mut [Item]) -> Result<(), ResolveError> {
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let existing = self
            .rows
            .find_groups(&ids)
            .await
            .map_err(ResolveError::Lookup)?;

        let mut unresolved = Vec::new();
        for (idx, item) in items.iter_mut().enumerate() {
            match existing.get(&item.id) {
                Some(group_id) => {
                    item.group_id = Some(group_id.clone());
                    crate::metrics::group_matched(MatchRule::Existing.as_str());
                }
                None => unresolved.push(idx),
            }
        }

        let snapshot: &[Item] = items;
        let resolved: Vec<(usize, Result<Resolution, ResolveError>)> = stream::iter(unresolved)
            .map(|idx| async move { (idx, self.match_or_mint(&snapshot[idx]).await) })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (idx, resolution) in resolved {
            items[idx].group_id = Some(resolution?.group_id);
        }
        Ok(())
    }

    async fn match_or_mint(&self, item: &Item) -> Result<Resolution, ResolveError> {
        let candidates: Vec<Candidate> = self
            .search
            .candidates(item.category_id, &item.name, self.config.candidates)
            .await
            .map_err(ResolveError::Search)?
            .into_iter()
            .filter(|candidate| candidate.id != item.id && candidate.group_id.is_some())
            .collect();

        let resolution = match self.match_candidates(item, &candidates).await {
            Some(found) => {
                crate::metrics::group_matched(found.rule.as_str());
                found
            }
            None => {
                crate::metrics::group_minted();
                Resolution {
                    group_id: Uuid::now_v7().to_string(),
                    rule: MatchRule::Minted,
                }
            }
        };
        debug!(
            target = "harvester.resolve",
            item_id = %item.id,
            candidates = candidates.len(),
            rule = resolution.rule.as_str(),
            group_id = %resolution.group_id,
            "group_resolved"
        );
        Ok(resolution)
    }

    async fn match_candidates(&self, item: &Item, candidates: &[Candidate]) -> Option<Resolution> {
        let group_of = |candidate: &Candidate| candidate.group_id.clone().unwrap_or_default();

        if let Some(code) = item.jan_code.as_deref().filter(|code| !code.is_empty())
            && let Some(hit) = candidates
                .iter()
                .find(|c| c.jan_code.as_deref() == Some(code))
        {
            return Some(Resolution::matched(&group_of(hit), MatchRule::ProductCode));
        }

        let name = item.name.trim();
        if let Some(hit) = candidates.iter().find(|c| c.name.trim() == name) {
            return Some(Resolution::matched(&group_of(hit), MatchRule::Name));
        }

        let own = self.first_image_hash(item).await?;
        for candidate in candidates {
            let Some(url) = candidate.image_urls.first() else {
                continue;
            };
            match self.hasher.hash(url).await {
                Ok(theirs) if own.distance(&theirs) <= self.config.max_distance => {
                    return Some(Resolution::matched(&group_of(candidate), MatchRule::Image));
                }
                Ok(_) => {}
                Err(err) => warn!(
                    target = "harvester.resolve",
                    item_id = %item.id,
                    candidate_id = %candidate.id,
                    url = %url,
                    error = %err,
                    "candidate_image_unusable"
                ),
            }
        }
        None
    }

    async fn first_image_hash(&self, item: &Item) -> Option<PerceptualHash> {
        let url = item.image_urls.first()?;
        match self.hasher.hash(url).await {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(
                    target = "harvester.resolve",
                    item_id = %item.id,
                    url = %url,
                    error = %err,
                    "item_image_unusable"
                );
                None
            }
        }
    }
}

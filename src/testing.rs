//! In-memory fakes shared by unit tests.

use crate::catalog::{
    CategoryMapping, CategoryRecord, CategoryTable, PlatformReference, TagRecord, TagTable,
    TagVocabulary,
};
use crate::images::{ImageError, ImageHasher, PerceptualHash};
use crate::marketplace::{FetchError, Marketplace, PageQuery, RawListing, SearchPage};
use crate::models::{Envelope, Item, ItemStatus, Platform};
use crate::normalize::NormalizeError;
use crate::queue::{Delivery, MessageBus, QueueError, shard_for};
use crate::store::{BulkFailure, Candidate, RowStore, SearchIndex, SinkError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn sample_item(id: &str, name: &str) -> Item {
    let platform = id
        .split(':')
        .next()
        .and_then(Platform::from_str)
        .unwrap_or(Platform::Rakuten);
    Item {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        status: ItemStatus::Active,
        url: format!("https://shop.example/{id}"),
        affiliate_url: None,
        price: 1000,
        image_urls: vec![format!("https://img.example/{id}.jpg")],
        average_rating: 0.0,
        review_count: 0,
        category_id: 10,
        category_ids: vec![1, 10],
        category_names: vec!["Furniture".into(), "Desks".into()],
        category_name: None,
        brand_name: None,
        colors: Vec::new(),
        width_range: None,
        depth_range: None,
        height_range: None,
        tag_ids: Vec::new(),
        jan_code: None,
        platform,
        group_id: None,
    }
}

/// Furniture > Desks > Standing Desks, Furniture > Shelves; marketplace ids
/// 215566/215567/300 map onto Desks/Standing Desks/Shelves.
pub fn furniture_reference() -> PlatformReference {
    let category = |id: i64, name: &str, level: u32, parent_id: Option<i64>| CategoryRecord {
        id,
        name: name.into(),
        level,
        parent_id,
    };
    let tag = |id: i64, name: &str, group_id: i64| TagRecord {
        id,
        name: name.into(),
        group_id,
    };
    PlatformReference::new(
        Arc::new(CategoryTable::new(vec![
            category(1, "Furniture", 1, None),
            category(10, "Desks", 2, Some(1)),
            category(100, "Standing Desks", 3, Some(10)),
            category(11, "Shelves", 2, Some(1)),
        ])),
        CategoryMapping::new(HashMap::from([(215566, 10), (215567, 100), (300, 11)])),
        TagTable::new(vec![
            tag(1000, "Acme", 7),
            tag(1001, "Zenith", 7),
            tag(2000, "Brown", 8),
            tag(2001, "White", 8),
        ]),
        TagVocabulary {
            brand_group_ids: vec![7],
            color_group_ids: vec![8],
            width_base_tag_id: Some(5000),
            depth_base_tag_id: Some(5100),
            height_base_tag_id: Some(5200),
        },
        Vec::new(),
    )
}

#[derive(Debug, Clone)]
pub struct FakeListing {
    pub id: String,
    pub price: i64,
}

impl FakeListing {
    pub fn new(id: impl Into<String>, price: i64) -> Self {
        Self {
            id: id.into(),
            price,
        }
    }
}

impl RawListing for FakeListing {
    fn price(&self) -> i64 {
        self.price
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

/// Serves listings sorted by price, `hits` per page, honouring the floor.
pub struct FakeMarketplace {
    hits: usize,
    ceiling: u32,
    workers: usize,
    delay: Option<Duration>,
    categories: HashMap<i64, Vec<FakeListing>>,
    failures: HashMap<i64, FetchError>,
    rejected: HashSet<String>,
    calls: AtomicUsize,
    seen: Mutex<BTreeSet<i64>>,
}

impl FakeMarketplace {
    pub fn new(hits: usize, ceiling: u32) -> Self {
        Self {
            hits,
            ceiling,
            workers: 1,
            delay: None,
            categories: HashMap::new(),
            failures: HashMap::new(),
            rejected: HashSet::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_category(mut self, category_id: i64, mut listings: Vec<FakeListing>) -> Self {
        listings.sort_by_key(|listing| listing.price);
        self.categories.insert(category_id, listings);
        self
    }

    pub fn with_failure(mut self, category_id: i64, error: FetchError) -> Self {
        self.failures.insert(category_id, error);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn rejecting<'a>(mut self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.rejected.extend(ids.into_iter().map(str::to_string));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn categories_seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().iter().copied().collect()
    }
}

#[async_trait]
impl Marketplace for FakeMarketplace {
    type Raw = FakeListing;

    fn platform(&self) -> Platform {
        Platform::Rakuten
    }

    fn page_ceiling(&self) -> u32 {
        self.ceiling
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn harvest_categories(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.categories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn fetch_page(
        &self,
        _worker: usize,
        query: &PageQuery,
    ) -> Result<SearchPage<FakeListing>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().insert(query.category_id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.get(&query.category_id) {
            return Err(err.clone());
        }
        let matching: Vec<&FakeListing> = self
            .categories
            .get(&query.category_id)
            .map(|listings| listings.iter().filter(|l| l.price >= query.min_price).collect())
            .unwrap_or_default();
        let start = (query.page.saturating_sub(1) as usize) * self.hits;
        let items = matching
            .iter()
            .skip(start)
            .take(self.hits)
            .map(|listing| (*listing).clone())
            .collect();
        Ok(SearchPage {
            items,
            total_count: matching.len() as u64,
        })
    }

    fn normalize(&self, raw: FakeListing, queried_category: i64) -> Result<Item, NormalizeError> {
        if self.rejected.contains(&raw.id) {
            return Err(NormalizeError::MissingField("itemName"));
        }
        let mut item = sample_item(&Platform::Rakuten.unique_id(&raw.id), &raw.id);
        item.price = raw.price;
        item.category_id = queried_category;
        Ok(item)
    }
}

#[derive(Default)]
struct ShardLog {
    entries: Vec<(String, Option<String>, Option<Envelope>)>,
    delivered: usize,
    pending: BTreeSet<usize>,
    backlog: bool,
}

/// Stream-like bus: each shard keeps a log, a delivery cursor and a
/// pending set that `rewind` replays.
pub struct MemoryBus {
    shards: Vec<Mutex<ShardLog>>,
    sequence: AtomicUsize,
    failing_publishes: AtomicUsize,
}

impl MemoryBus {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(ShardLog::default())).collect(),
            sequence: AtomicUsize::new(0),
            failing_publishes: AtomicUsize::new(0),
        }
    }

    fn next_id(&self) -> String {
        format!("{}-0", self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Messages ever appended, across shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().entries.len()).sum()
    }

    pub fn drain(&self, shard: usize) -> Vec<Envelope> {
        let mut log = self.shards[shard].lock().unwrap();
        let envelopes = log.entries.iter().filter_map(|(_, _, e)| e.clone()).collect();
        *log = ShardLog::default();
        envelopes
    }

    /// Appends a raw entry, bypassing encoding. `None` mimics a trimmed entry.
    pub fn push_raw(&self, shard: usize, payload: Option<&str>) {
        let id = self.next_id();
        self.shards[shard]
            .lock()
            .unwrap()
            .entries
            .push((id, payload.map(str::to_string), None));
    }

    pub fn pending(&self, shard: usize) -> usize {
        self.shards[shard].lock().unwrap().pending.len()
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    async fn publish(&self, batch: &[Envelope]) -> Result<(), QueueError> {
        let failing = self.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_publishes.store(failing - 1, Ordering::SeqCst);
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "injected failure",
            ))));
        }
        for envelope in batch {
            let id = self.next_id();
            let shard = shard_for(&envelope.ordering_key, self.shards.len());
            self.shards[shard].lock().unwrap().entries.push((
                id,
                Some(envelope.payload.clone()),
                Some(envelope.clone()),
            ));
        }
        Ok(())
    }

    async fn pull(&self, shard: usize, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut log = self.shards[shard].lock().unwrap();
        let deliver = |log: &ShardLog, idx: usize| Delivery {
            id: log.entries[idx].0.clone(),
            payload: log.entries[idx].1.clone(),
        };
        if log.backlog {
            let replay: Vec<Delivery> = log.pending.iter().take(max).map(|idx| deliver(&*log, *idx)).collect();
            if !replay.is_empty() {
                return Ok(replay);
            }
            log.backlog = false;
        }
        let end = (log.delivered + max).min(log.entries.len());
        let fresh: Vec<Delivery> = (log.delivered..end).map(|idx| deliver(&*log, idx)).collect();
        for idx in log.delivered..end {
            log.pending.insert(idx);
        }
        log.delivered = end;
        Ok(fresh)
    }

    async fn ack(&self, shard: usize, ids: &[String]) -> Result<(), QueueError> {
        let mut log = self.shards[shard].lock().unwrap();
        let acked: Vec<usize> = log
            .pending
            .iter()
            .copied()
            .filter(|idx| ids.contains(&log.entries[*idx].0))
            .collect();
        for idx in acked {
            log.pending.remove(&idx);
        }
        Ok(())
    }

    async fn rewind(&self, shard: usize) {
        self.shards[shard].lock().unwrap().backlog = true;
    }
}

#[derive(Default)]
pub struct MemoryRowStore {
    rows: Mutex<HashMap<String, Item>>,
    failing: AtomicBool,
}

impl MemoryRowStore {
    pub fn insert(&self, item: Item) {
        self.rows.lock().unwrap().insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<Item> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn fail_upserts(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn find_groups(&self, ids: &[String]) -> Result<HashMap<String, String>, SinkError> {
        let rows = self.rows.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let group = rows.get(id)?.group_id.clone()?;
                Some((id.clone(), group))
            })
            .collect())
    }

    async fn upsert(&self, items: &[Item]) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Status {
                status: 503,
                body: "row store unavailable".into(),
            });
        }
        let mut rows = self.rows.lock().unwrap();
        for item in items {
            rows.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }
}

/// Candidates are same-category documents sharing a lowercase word with
/// the query, in insertion order.
#[derive(Default)]
pub struct MemorySearchIndex {
    docs: Mutex<Vec<Item>>,
    failing_ids: Mutex<HashSet<String>>,
    failing_queries: AtomicBool,
}

impl MemorySearchIndex {
    pub fn insert(&self, item: Item) {
        let mut docs = self.docs.lock().unwrap();
        match docs.iter_mut().find(|doc| doc.id == item.id) {
            Some(doc) => *doc = item,
            None => docs.push(item),
        }
    }

    pub fn get(&self, id: &str) -> Option<Item> {
        self.docs.lock().unwrap().iter().find(|doc| doc.id == id).cloned()
    }

    pub fn fail_bulk_for(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_queries(&self, failing: bool) {
        self.failing_queries.store(failing, Ordering::SeqCst);
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn candidates(
        &self,
        category_id: i64,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, SinkError> {
        if self.failing_queries.load(Ordering::SeqCst) {
            return Err(SinkError::Request("connection refused".into()));
        }
        let query = words(name);
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|doc| doc.category_id == category_id)
            .filter(|doc| !words(&doc.name).is_disjoint(&query))
            .take(limit)
            .map(|doc| Candidate {
                id: doc.id.clone(),
                name: doc.name.clone(),
                jan_code: doc.jan_code.clone(),
                image_urls: doc.image_urls.clone(),
                group_id: doc.group_id.clone(),
            })
            .collect())
    }

    async fn bulk_write(&self, items: &[Item]) -> Result<(), SinkError> {
        let failing = self.failing_ids.lock().unwrap().clone();
        let mut failures = Vec::new();
        for item in items {
            if failing.contains(&item.id) {
                failures.push(BulkFailure {
                    id: item.id.clone(),
                    status: 400,
                    reason: "mapper_parsing_exception".into(),
                });
            } else if item.is_active() {
                self.insert(item.clone());
            } else {
                self.docs.lock().unwrap().retain(|doc| doc.id != item.id);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Bulk(failures))
        }
    }
}

/// Hashes from a fixed table; unknown URLs fail like a dead link.
#[derive(Default)]
pub struct FixedHasher {
    hashes: Mutex<HashMap<String, u64>>,
}

impl FixedHasher {
    pub fn set(&self, url: &str, hash: u64) {
        self.hashes.lock().unwrap().insert(url.to_string(), hash);
    }
}

#[async_trait]
impl ImageHasher for FixedHasher {
    async fn hash(&self, url: &str) -> Result<PerceptualHash, ImageError> {
        self.hashes
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .map(PerceptualHash)
            .ok_or_else(|| ImageError::Download("HTTP 404 Not Found".into()))
    }
}

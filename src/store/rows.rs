use crate::models::{Item, ItemStatus, Platform};
use crate::store::{RowStore, SinkError, ensure_success};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// PostgREST caps URL length well before this; keeps `in.(...)` filters short.
const LOOKUP_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct RowStoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub table: String,
}

/// Supabase (PostgREST) table client keyed by the item's unique id.
#[derive(Debug, Clone)]
pub struct SupabaseRowStore {
    http: Client,
    config: RowStoreConfig,
}

/// Relational row; dimension ranges are stored as `[gte, lte]` pairs.
#[derive(Debug, Serialize)]
struct ItemRow<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    status: ItemStatus,
    url: &'a str,
    affiliate_url: Option<&'a str>,
    price: i64,
    image_urls: &'a [String],
    average_rating: f64,
    review_count: i64,
    category_id: i64,
    category_ids: &'a [i64],
    category_names: &'a [String],
    brand_name: Option<&'a str>,
    colors: &'a [String],
    width_range: Option<(i32, Option<i32>)>,
    depth_range: Option<(i32, Option<i32>)>,
    height_range: Option<(i32, Option<i32>)>,
    tag_ids: &'a [i64],
    jan_code: Option<&'a str>,
    platform: Platform,
    group_id: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

impl<'a> ItemRow<'a> {
    fn from_item(item: &'a Item, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: &item.id,
            name: &item.name,
            description: &item.description,
            status: item.status,
            url: &item.url,
            affiliate_url: item.affiliate_url.as_deref(),
            price: item.price,
            image_urls: &item.image_urls,
            average_rating: item.average_rating,
            review_count: item.review_count,
            category_id: item.category_id,
            category_ids: &item.category_ids,
            category_names: &item.category_names,
            brand_name: item.brand_name.as_deref(),
            colors: &item.colors,
            width_range: item.width_range.map(|r| r.as_pair()),
            depth_range: item.depth_range.map(|r| r.as_pair()),
            height_range: item.height_range.map(|r| r.as_pair()),
            tag_ids: &item.tag_ids,
            jan_code: item.jan_code.as_deref(),
            platform: item.platform,
            group_id: item.group_id.as_deref(),
            updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    id: String,
    #[serde(default)]
    group_id: Option<String>,
}

impl SupabaseRowStore {
    pub fn new(http: Client, config: RowStoreConfig) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            http,
            config: RowStoreConfig { base_url, ..config },
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.config.base_url, self.config.table)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.config.service_key)
            .header("Authorization", format!("Bearer {}", self.config.service_key))
    }
}

/// PostgREST `in.(...)` list with every id quoted, since ids contain `:`.
fn in_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

#[async_trait]
impl RowStore for SupabaseRowStore {
    async fn find_groups(&self, ids: &[String]) -> Result<HashMap<String, String>, SinkError> {
        let mut groups = HashMap::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let response = self
                .authorized(self.http.get(self.table_url()))
                .query(&[("select", "id,group_id".to_string()), ("id", in_filter(chunk))])
                .send()
                .await
                .map_err(|err| SinkError::Request(err.to_string()))?;
            let rows: Vec<GroupRow> = ensure_success(response)
                .await?
                .json()
                .await
                .map_err(|err| SinkError::Deserialize(err.to_string()))?;
            groups.extend(
                rows.into_iter()
                    .filter_map(|row| Some((row.id, row.group_id?))),
            );
        }
        Ok(groups)
    }

    async fn upsert(&self, items: &[Item]) -> Result<(), SinkError> {
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let rows: Vec<ItemRow<'_>> = items.iter().map(|item| ItemRow::from_item(item, now)).collect();
        let response = self
            .authorized(self.http.post(self.table_url()))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows)
            .send()
            .await
            .map_err(|err| SinkError::Request(err.to_string()))?;
        ensure_success(response).await?;
        debug!(target = "harvester.sink", table = %self.config.table, rows = rows.len(), "rows_upserted");
        Ok(())
    }
}

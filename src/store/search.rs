use crate::dimensions::{MetadataFacet, dimension_facets};
use crate::models::Item;
use crate::store::{BulkFailure, Candidate, SearchIndex, SinkError, ensure_success};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

const CANDIDATE_FIELDS: [&str; 5] = ["id", "name", "jan_code", "image_urls", "group_id"];

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Elasticsearch/OpenSearch REST client.
pub struct HttpSearchIndex {
    http: Client,
    config: SearchConfig,
}

/// Indexed form of an item: the canonical fields plus dimension facets.
#[derive(Debug, Serialize)]
struct SearchDocument<'a> {
    #[serde(flatten)]
    item: &'a Item,
    metadata: Vec<MetadataFacet>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: Candidate,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItemResult>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResult {
    #[serde(rename = "_id", default)]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: String,
}

impl HttpSearchIndex {
    pub fn new(http: Client, config: SearchConfig) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            http,
            config: SearchConfig { base_url, ..config },
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.config.base_url, self.config.index, path);
        let builder = self.http.request(method, url);
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    fn bulk_body(&self, items: &[Item]) -> Result<String, SinkError> {
        let updated_at = Utc::now();
        let mut body = String::new();
        for item in items {
            if item.is_active() {
                let action = json!({ "index": { "_index": self.config.index, "_id": item.id } });
                let document = SearchDocument {
                    item,
                    metadata: dimension_facets(item),
                    updated_at,
                };
                body.push_str(&action.to_string());
                body.push('\n');
                body.push_str(
                    &serde_json::to_string(&document)
                        .map_err(|err| SinkError::Deserialize(err.to_string()))?,
                );
            } else {
                let action = json!({ "delete": { "_index": self.config.index, "_id": item.id } });
                body.push_str(&action.to_string());
            }
            body.push('\n');
        }
        Ok(body)
    }
}

/// Per-document failures out of a bulk response. Deleting a document that
/// is already gone counts as success.
fn bulk_failures(response: BulkResponse) -> Vec<BulkFailure> {
    if !response.errors {
        return Vec::new();
    }
    response
        .items
        .into_iter()
        .flat_map(|entry| entry.into_iter())
        .filter(|(action, result)| {
            result.status >= 300 && !(action == "delete" && result.status == 404)
        })
        .map(|(_, result)| {
            let reason = result
                .error
                .map(|err| format!("{}: {}", err.kind, err.reason))
                .unwrap_or_else(|| "unknown error".into());
            BulkFailure {
                id: result.id,
                status: result.status,
                reason,
            }
        })
        .collect()
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn candidates(
        &self,
        category_id: i64,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, SinkError> {
        let query = json!({
            "size": limit,
            "_source": CANDIDATE_FIELDS,
            "query": {
                "bool": {
                    "filter": [{ "term": { "category_id": category_id } }],
                    "must": [{ "match": { "name": name } }]
                }
            }
        });
        let response = self
            .request(reqwest::Method::POST, "_search")
            .json(&query)
            .send()
            .await
            .map_err(|err| SinkError::Request(err.to_string()))?;
        let body: SearchResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|err| SinkError::Deserialize(err.to_string()))?;
        Ok(body.hits.hits.into_iter().map(|hit| hit.source).collect())
    }

    async fn bulk_write(&self, items: &[Item]) -> Result<(), SinkError> {
        if items.is_empty() {
            return Ok(());
        }
        let body = self.bulk_body(items)?;
        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|err| SinkError::Request(err.to_string()))?;
        let parsed: BulkResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|err| SinkError::Deserialize(err.to_string()))?;

        let failures = bulk_failures(parsed);
        if !failures.is_empty() {
            warn!(
                target = "harvester.sink",
                index = %self.config.index,
                failed = failures.len(),
                total = items.len(),
                "bulk_partial_failure"
            );
            return Err(SinkError::Bulk(failures));
        }
        debug!(target = "harvester.sink", index = %self.config.index, documents = items.len(), "bulk_written");
        Ok(())
    }
}

use crate::catalog::PlatformReference;
use crate::credentials::{Credential, CredentialPool};
use crate::marketplace::{
    FetchError, Marketplace, PageQuery, RawListing, RetryPolicy, SearchPage, read_json,
    request_error, with_retry,
};
use crate::models::{Item, Platform};
use crate::normalize::{self, NormalizeContext, NormalizeError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://shopping.yahooapis.jp/ShoppingWebService/V3/itemSearch";

const RESULTS_PER_PAGE: u32 = 100;
const MAX_POSITION: u32 = 1000;
const PAGE_CEILING: u32 = 10;
const QUOTA_MARKERS: &[&str] = &["limit exceeded", "rate limit", "quota"];

#[derive(Debug, Clone)]
pub struct YahooConfig {
    pub endpoint: String,
    pub affiliate_id: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YahooSearchResponse {
    #[serde(default)]
    pub total_results_available: u64,
    #[serde(default)]
    pub total_results_returned: u64,
    #[serde(default)]
    pub first_results_position: u64,
    #[serde(default)]
    pub hits: Vec<YahooHit>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YahooHit {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub head_line: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub affiliate_url: Option<String>,
    #[serde(default)]
    pub in_stock: Option<bool>,
    #[serde(default)]
    pub code: String,
    pub price: i64,
    #[serde(default)]
    pub image: YahooImage,
    #[serde(default)]
    pub ex_image: Option<YahooExImage>,
    #[serde(default)]
    pub review: YahooReview,
    #[serde(default)]
    pub jan_code: Option<String>,
    #[serde(default)]
    pub brand: Option<YahooBrand>,
    #[serde(default)]
    pub genre_category: Option<YahooGenre>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct YahooImage {
    #[serde(default)]
    pub small: Option<String>,
    #[serde(default)]
    pub medium: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YahooExImage {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct YahooReview {
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YahooBrand {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YahooGenre {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub depth: u32,
}

impl RawListing for YahooHit {
    fn price(&self) -> i64 {
        self.price
    }

    fn source_id(&self) -> &str {
        &self.code
    }
}

pub struct YahooClient {
    http: Client,
    config: YahooConfig,
    credentials: Arc<CredentialPool>,
    reference: Arc<PlatformReference>,
}

/// `start` and `results` for a 1-based page. The API rejects
/// `start + results > 1000`, so the last page is one short.
fn page_window(page: u32) -> (u32, u32) {
    let start = (page.clamp(1, PAGE_CEILING) - 1) * RESULTS_PER_PAGE + 1;
    (start, RESULTS_PER_PAGE.min(MAX_POSITION - start))
}

impl YahooClient {
    pub fn new(
        http: Client,
        config: YahooConfig,
        credentials: Arc<CredentialPool>,
        reference: Arc<PlatformReference>,
    ) -> Self {
        Self {
            http,
            config,
            credentials,
            reference,
        }
    }

    async fn request(
        &self,
        credential: Credential,
        query: PageQuery,
    ) -> Result<YahooSearchResponse, FetchError> {
        let (start, results) = page_window(query.page);
        let mut params: Vec<(&str, String)> = vec![
            ("appid", credential.key.clone()),
            ("genre_category_id", query.category_id.to_string()),
            ("start", start.to_string()),
            ("results", results.to_string()),
            ("sort", "+price".into()),
        ];
        if query.min_price > 0 {
            params.push(("price_from", query.min_price.to_string()));
        }
        if let Some(affiliate_id) = &self.config.affiliate_id {
            params.push(("affiliate_type", "vc".into()));
            params.push(("affiliate_id", affiliate_id.clone()));
        }

        let response = self
            .http
            .get(&self.config.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(request_error)?;
        read_json(response, &credential, QUOTA_MARKERS).await
    }
}

#[async_trait]
impl Marketplace for YahooClient {
    type Raw = YahooHit;

    fn platform(&self) -> Platform {
        Platform::Yahoo
    }

    fn page_ceiling(&self) -> u32 {
        PAGE_CEILING
    }

    fn workers(&self) -> usize {
        self.credentials.len()
    }

    fn harvest_categories(&self) -> Vec<i64> {
        self.reference.harvest_categories()
    }

    async fn fetch_page(
        &self,
        worker: usize,
        query: &PageQuery,
    ) -> Result<SearchPage<YahooHit>, FetchError> {
        let query = *query;
        let body = with_retry(
            Platform::Yahoo,
            &self.credentials,
            &self.config.retry,
            worker,
            |credential| self.request(credential, query),
        )
        .await?;
        crate::metrics::page_fetched(Platform::Yahoo);
        debug!(
            target = "harvester.fetch",
            platform = "yahoo",
            category_id = query.category_id,
            min_price = query.min_price,
            page = query.page,
            returned = body.total_results_returned,
            first_position = body.first_results_position,
            total = body.total_results_available,
            "page_fetched"
        );
        Ok(SearchPage {
            items: body.hits,
            total_count: body.total_results_available,
        })
    }

    fn normalize(&self, raw: YahooHit, queried_category: i64) -> Result<Item, NormalizeError> {
        let ctx = NormalizeContext {
            platform: Platform::Yahoo,
            reference: &self.reference,
            queried_category,
        };
        normalize::yahoo::normalize(raw, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::furniture_reference;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> YahooClient {
        YahooClient::new(
            Client::new(),
            YahooConfig {
                endpoint: format!("{}/itemSearch", server.uri()),
                affiliate_id: None,
                retry: RetryPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
            },
            Arc::new(CredentialPool::new(vec!["app-1".into()], Duration::ZERO)),
            Arc::new(furniture_reference()),
        )
    }

    #[tokio::test]
    async fn page_maps_to_start_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("appid", "app-1"))
            .and(query_param("genre_category_id", "300"))
            .and(query_param("start", "201"))
            .and(query_param("results", "100"))
            .and(query_param("price_from", "5000"))
            .and(query_param("sort", "+price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalResultsAvailable": 245,
                "totalResultsReturned": 1,
                "firstResultsPosition": 201,
                "hits": [{
                    "name": "Walnut shelf",
                    "code": "store_1",
                    "price": 5400,
                    "url": "https://store.shopping.yahoo.co.jp/store/1.html",
                    "inStock": true,
                    "image": { "medium": "https://item-shopping.c.yimg.jp/i/g/store_1" },
                    "review": { "rate": 4.0, "count": 3 }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server)
            .fetch_page(
                0,
                &PageQuery {
                    category_id: 300,
                    min_price: 5000,
                    page: 3,
                },
            )
            .await
            .expect("page");
        assert_eq!(page.total_count, 245);
        assert_eq!(page.items[0].source_id(), "store_1");
        assert_eq!(page.items[0].review.count, 3);
    }

    #[test]
    fn every_page_stays_inside_the_result_window() {
        assert_eq!(page_window(1), (1, 100));
        assert_eq!(page_window(9), (801, 100));
        for page in 1..=PAGE_CEILING {
            let (start, results) = page_window(page);
            assert!(start + results <= MAX_POSITION, "page {page}");
        }
    }

    #[tokio::test]
    async fn last_page_shortens_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("start", "901"))
            .and(query_param("results", "99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalResultsAvailable": 4000,
                "totalResultsReturned": 0,
                "firstResultsPosition": 901,
                "hits": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let page = client
            .fetch_page(
                0,
                &PageQuery {
                    category_id: 300,
                    min_price: 0,
                    page: client.page_ceiling(),
                },
            )
            .await
            .expect("last page");
        assert_eq!(page.total_count, 4000);
    }

    #[tokio::test]
    async fn throttling_keeps_the_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded, retry later"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client
            .fetch_page(
                0,
                &PageQuery {
                    category_id: 300,
                    min_price: 0,
                    page: 1,
                },
            )
            .await
            .expect_err("throttled");
        assert!(err.is_transient());
        assert_eq!(client.credentials.available(), 1);
    }

    #[tokio::test]
    async fn limit_message_exhausts_the_only_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("<Error><Message>Rate limit exceeded</Message></Error>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_page(
                0,
                &PageQuery {
                    category_id: 300,
                    min_price: 0,
                    page: 1,
                },
            )
            .await
            .expect_err("exhausted");
        assert_eq!(err, FetchError::AllCredentialsExhausted);
    }
}

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
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str =
    "https://app.rakuten.co.jp/services/api/IchibaItem/Search/20220601";

const HITS_PER_PAGE: u32 = 30;
const PAGE_CEILING: u32 = 100;
const QUOTA_MARKERS: &[&str] = &["daily limit", "quota exceeded", "limit exceeded"];

#[derive(Debug, Clone)]
pub struct RakutenConfig {
    pub endpoint: String,
    pub affiliate_id: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RakutenSearchResponse {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_count: u32,
    #[serde(rename = "Items", default)]
    pub items: Vec<RakutenItem>,
}

/// One entry of `Items` in `formatVersion=2` responses.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RakutenItem {
    #[serde(default)]
    pub item_name: String,
    #[serde(default)]
    pub catchcopy: String,
    #[serde(default)]
    pub item_code: String,
    pub item_price: i64,
    #[serde(default)]
    pub item_caption: String,
    #[serde(default)]
    pub item_url: String,
    #[serde(default)]
    pub affiliate_url: Option<String>,
    #[serde(default)]
    pub availability: Option<i64>,
    #[serde(default)]
    pub medium_image_urls: Vec<String>,
    #[serde(default)]
    pub small_image_urls: Vec<String>,
    #[serde(default)]
    pub review_count: i64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub review_average: f64,
    #[serde(default)]
    pub shop_code: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub genre_id: i64,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
}

impl RawListing for RakutenItem {
    fn price(&self) -> i64 {
        self.item_price
    }

    fn source_id(&self) -> &str {
        &self.item_code
    }
}

pub struct RakutenClient {
    http: Client,
    config: RakutenConfig,
    credentials: Arc<CredentialPool>,
    reference: Arc<PlatformReference>,
}

impl RakutenClient {
    pub fn new(
        http: Client,
        config: RakutenConfig,
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
    ) -> Result<RakutenSearchResponse, FetchError> {
        let mut params: Vec<(&str, String)> = vec![
            ("applicationId", credential.key.clone()),
            ("genreId", query.category_id.to_string()),
            ("page", query.page.to_string()),
            ("hits", HITS_PER_PAGE.to_string()),
            ("sort", "+itemPrice".into()),
            ("availability", "0".into()),
            ("format", "json".into()),
            ("formatVersion", "2".into()),
        ];
        if query.min_price > 0 {
            params.push(("minPrice", query.min_price.to_string()));
        }
        if let Some(affiliate_id) = &self.config.affiliate_id {
            params.push(("affiliateId", affiliate_id.clone()));
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
impl Marketplace for RakutenClient {
    type Raw = RakutenItem;

    fn platform(&self) -> Platform {
        Platform::Rakuten
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
    ) -> Result<SearchPage<RakutenItem>, FetchError> {
        let query = *query;
        let body = with_retry(
            Platform::Rakuten,
            &self.credentials,
            &self.config.retry,
            worker,
            |credential| self.request(credential, query),
        )
        .await?;
        crate::metrics::page_fetched(Platform::Rakuten);
        debug!(
            target = "harvester.fetch",
            platform = "rakuten",
            category_id = query.category_id,
            min_price = query.min_price,
            page = query.page,
            returned = body.items.len(),
            total = body.count,
            page_count = body.page_count,
            "page_fetched"
        );
        Ok(SearchPage {
            items: body.items,
            total_count: body.count,
        })
    }

    fn normalize(&self, raw: RakutenItem, queried_category: i64) -> Result<Item, NormalizeError> {
        let ctx = NormalizeContext {
            platform: Platform::Rakuten,
            reference: &self.reference,
            queried_category,
        };
        normalize::rakuten::normalize(raw, ctx)
    }
}

pub mod rakuten;
pub mod yahoo;

use crate::credentials::{Credential, CredentialPool};
use crate::models::{Item, Platform};
use crate::normalize::NormalizeError;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

pub use rakuten::RakutenClient;
pub use yahoo::YahooClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("credential {0} exhausted its call budget")]
    CredentialExhausted(String),
    #[error("every credential is exhausted")]
    AllCredentialsExhausted,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// One "category, price >= floor, page N" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub category_id: i64,
    pub min_price: i64,
    pub page: u32,
}

#[derive(Debug, Clone)]
pub struct SearchPage<T> {
    pub items: Vec<T>,
    /// Results the API reports for the current price floor.
    pub total_count: u64,
}

/// What the cursor and pool need to know about a raw marketplace record.
pub trait RawListing {
    fn price(&self) -> i64;
    fn source_id(&self) -> &str;
}

#[async_trait]
pub trait Marketplace: Send + Sync + 'static {
    type Raw: RawListing + Send + Sync + 'static;

    fn platform(&self) -> Platform;

    /// Highest page number the API will serve for one query.
    fn page_ceiling(&self) -> u32;

    /// One worker per usable credential.
    fn workers(&self) -> usize;

    fn harvest_categories(&self) -> Vec<i64>;

    async fn fetch_page(
        &self,
        worker: usize,
        query: &PageQuery,
    ) -> Result<SearchPage<Self::Raw>, FetchError>;

    /// `queried_category` is the category the item was harvested under.
    fn normalize(&self, raw: Self::Raw, queried_category: i64) -> Result<Item, NormalizeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the given retry (1-based), capped, with up to
    /// 25% jitter on top.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return capped;
        }
        let jitter = rand::rng().random_range(0..=jitter_ms);
        capped + Duration::from_millis(jitter)
    }
}

/// Runs one upstream call on behalf of `worker`: waits for the credential's
/// turn, retires credentials that report quota exhaustion and retries
/// transient failures with backoff.
pub async fn with_retry<T, F, Fut>(
    platform: Platform,
    credentials: &CredentialPool,
    policy: &RetryPolicy,
    worker: usize,
    mut call: F,
) -> Result<T, FetchError>
where
    F: FnMut(Credential) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        let idx = credentials
            .checkout(worker)
            .ok_or(FetchError::AllCredentialsExhausted)?;
        let credential = credentials
            .get(idx)
            .cloned()
            .ok_or(FetchError::AllCredentialsExhausted)?;
        credentials.wait_turn(idx).await;

        match call(credential).await {
            Ok(value) => return Ok(value),
            Err(FetchError::CredentialExhausted(_)) => {
                credentials.mark_exhausted(idx);
            }
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                warn!(
                    target = "harvester.fetch",
                    platform = platform.as_str(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "fetch_retry"
                );
                crate::metrics::fetch_retry(platform);
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn request_error(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Transient(err.to_string())
    }
}

/// Decodes a successful body or maps the failure onto `FetchError`.
/// `quota_markers` are lowercase fragments of the API's quota message.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    credential: &Credential,
    quota_markers: &[&str],
) -> Result<T, FetchError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(request_error);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body, credential, quota_markers))
}

fn classify_failure(
    status: StatusCode,
    body: &str,
    credential: &Credential,
    quota_markers: &[&str],
) -> FetchError {
    let lowered = body.to_lowercase();
    let quota = quota_markers.iter().any(|marker| lowered.contains(marker));
    let snippet: String = body.chars().take(200).collect();
    match status {
        // 429 is throttling, never quota, whatever the body says.
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN if quota => {
            FetchError::CredentialExhausted(credential.label.clone())
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            FetchError::Transient(format!("HTTP {status}: {snippet}"))
        }
        status if status.is_server_error() => {
            FetchError::Transient(format!("HTTP {status}: {snippet}"))
        }
        status => FetchError::Rejected(format!("HTTP {status}: {snippet}")),
    }
}

use crate::catalog::ReferenceData;
use crate::harvest::PriceBounds;
use crate::marketplace::{RetryPolicy, rakuten, yahoo};
use crate::pipeline::IngestConfig;
use crate::queue::{PublisherConfig, StreamConfig};
use crate::resolver::ResolverConfig;
use crate::store::{RowStoreConfig, SearchConfig};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("cannot read reference data {path}: {message}")]
    Reference { path: String, message: String },
}

#[derive(Debug, Clone)]
pub struct MarketplaceSettings {
    pub keys: Vec<String>,
    pub endpoint: String,
    pub affiliate_id: Option<String>,
}

/// Everything the process needs, resolved once at startup. Components take
/// the relevant pieces as constructor arguments.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub port: u16,
    pub rakuten: MarketplaceSettings,
    pub yahoo: MarketplaceSettings,
    pub request_interval: Duration,
    pub retry: RetryPolicy,
    pub price_bounds: PriceBounds,
    pub auto_harvest: bool,
    pub start_category_id: Option<i64>,
    pub redis_url: String,
    pub streams: StreamConfig,
    pub publisher: PublisherConfig,
    pub ingest: IngestConfig,
    pub search: SearchConfig,
    pub rows: RowStoreConfig,
    pub resolver: ResolverConfig,
    pub image_max_bytes: usize,
    pub image_cache_capacity: usize,
    pub reference_path: Option<String>,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub job_queue_capacity: usize,
}

struct Settings<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Settings<F> {
    fn text(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn text_or(&self, name: &str, default: &str) -> String {
        self.text(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.text(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.text(name).and_then(|value| value.parse().ok())
    }

    /// Positive number, else `default`.
    fn positive<T: FromStr + PartialOrd + Default>(&self, name: &str, default: T) -> T {
        self.parsed(name).filter(|v| *v > T::default()).unwrap_or(default)
    }

    fn millis(&self, name: &str, default: u64) -> Duration {
        Duration::from_millis(self.positive(name, default))
    }

    fn flag(&self, name: &str) -> bool {
        self.text(name)
            .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.text(name)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl HarvesterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Settings { lookup };
        let retry = RetryPolicy {
            max_attempts: env.positive("RETRY_MAX_ATTEMPTS", 5),
            base_delay: env.millis("RETRY_BASE_DELAY_MS", 500),
            max_delay: env.millis("RETRY_MAX_DELAY_MS", 30_000),
        };
        let shards = env.positive("STREAM_SHARDS", 4usize);
        let consumer = env
            .text("CONSUMER_NAME")
            .unwrap_or_else(|| format!("consumer-{}", std::process::id()));

        Ok(Self {
            port: env.positive("PORT", 8000),
            rakuten: MarketplaceSettings {
                keys: env.list("RAKUTEN_APPLICATION_IDS"),
                endpoint: env.text_or("RAKUTEN_ENDPOINT", rakuten::DEFAULT_ENDPOINT),
                affiliate_id: env.text("RAKUTEN_AFFILIATE_ID"),
            },
            yahoo: MarketplaceSettings {
                keys: env.list("YAHOO_APP_IDS"),
                endpoint: env.text_or("YAHOO_ENDPOINT", yahoo::DEFAULT_ENDPOINT),
                affiliate_id: env.text("YAHOO_AFFILIATE_ID"),
            },
            request_interval: Duration::from_millis(
                env.parsed("REQUEST_INTERVAL_MS").unwrap_or(1000),
            ),
            retry,
            price_bounds: PriceBounds {
                min_price: env.parsed("HARVEST_MIN_PRICE").filter(|v| *v >= 0).unwrap_or(0),
                max_price: env.positive("HARVEST_MAX_PRICE", 100_000_000),
            },
            auto_harvest: env.flag("AUTO_HARVEST"),
            start_category_id: env.parsed("START_CATEGORY_ID"),
            redis_url: env.required("REDIS_URL")?,
            streams: StreamConfig {
                namespace: env.text_or("STREAM_NAMESPACE", "harvester"),
                shards,
                group: env.text_or("CONSUMER_GROUP", "ingest"),
                consumer,
                max_len: env.positive("STREAM_MAX_LEN", 1_000_000),
            },
            publisher: PublisherConfig {
                batch_size: env.positive("PUBLISH_BATCH_SIZE", 100),
                linger: env.millis("PUBLISH_LINGER_MS", 200),
                capacity: env.positive("PUBLISH_QUEUE_CAPACITY", 1000),
                retry,
            },
            ingest: IngestConfig {
                batch_size: env.positive("CONSUMER_BATCH_SIZE", 100),
                idle_wait: env.millis("CONSUMER_IDLE_MS", 1000),
                retry,
            },
            search: SearchConfig {
                base_url: env.required("SEARCH_URL")?,
                index: env.text_or("SEARCH_INDEX", "items"),
                username: env.text("SEARCH_USERNAME"),
                password: env.text("SEARCH_PASSWORD"),
            },
            rows: RowStoreConfig {
                base_url: env.required("SUPABASE_URL")?,
                service_key: env
                    .text("SUPABASE_SERVICE_ROLE_KEY")
                    .or_else(|| env.text("SUPABASE_SERVICE_KEY"))
                    .ok_or(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?,
                table: env.text_or("ROW_TABLE", "items"),
            },
            resolver: ResolverConfig {
                candidates: env.positive("RESOLVER_CANDIDATES", 10),
                max_distance: env.parsed("RESOLVER_MAX_DISTANCE").unwrap_or(10),
                concurrency: env.positive("RESOLVER_CONCURRENCY", 8),
            },
            image_max_bytes: env.positive("IMAGE_MAX_BYTES", 5 * 1024 * 1024),
            image_cache_capacity: env.positive("IMAGE_CACHE_CAPACITY", 10_000),
            reference_path: env.text("REFERENCE_DATA_PATH"),
            http_timeout: Duration::from_secs(env.positive("HTTP_TIMEOUT_SECS", 30)),
            http_connect_timeout: Duration::from_secs(env.positive("HTTP_CONNECT_TIMEOUT_SECS", 10)),
            job_queue_capacity: env.positive("JOB_QUEUE_CAPACITY", 16),
        })
    }
}

/// Category tables, tag tables and vocabularies for every platform.
pub fn load_reference(path: impl AsRef<Path>) -> Result<ReferenceData, ConfigError> {
    let path = path.as_ref();
    let reference_error = |message: String| ConfigError::Reference {
        path: path.display().to_string(),
        message,
    };
    let raw = std::fs::read_to_string(path).map_err(|err| reference_error(err.to_string()))?;
    serde_yaml::from_str(&raw).map_err(|err| reference_error(err.to_string()))
}

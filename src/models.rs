use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Rakuten,
    Yahoo,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Rakuten => "rakuten",
            Platform::Yahoo => "yahoo",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "rakuten" | "rakuten_ichiba" => Some(Platform::Rakuten),
            "yahoo" | "yahoo_shopping" => Some(Platform::Yahoo),
            _ => None,
        }
    }

    /// Builds the `platform:source_id` unique id used by every sink.
    pub fn unique_id(&self, source_id: &str) -> String {
        format!("{}:{}", self.as_str(), source_id.trim())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    Inactive,
}

/// Centimetre range; `lte == None` is an open upper bound.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DimensionRange {
    pub gte: i32,
    #[serde(default)]
    pub lte: Option<i32>,
}

impl DimensionRange {
    pub fn new(gte: i32, lte: Option<i32>) -> Self {
        Self { gte, lte }
    }

    pub fn contains(&self, value: i32) -> bool {
        value >= self.gte && self.lte.is_none_or(|upper| value <= upper)
    }

    /// Row-store representation: `[gte, lte]` with `null` for unlimited.
    pub fn as_pair(&self) -> (i32, Option<i32>) {
        (self.gte, self.lte)
    }
}

/// Canonical listing shared by every marketplace.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ItemStatus,
    pub url: String,
    #[serde(default)]
    pub affiliate_url: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub average_rating: f64,
    #[serde(default)]
    pub review_count: i64,
    pub category_id: i64,
    #[serde(default)]
    pub category_ids: Vec<i64>,
    #[serde(default)]
    pub category_names: Vec<String>,
    /// Marketplace-provided category label; dropped on ingest.
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub brand_name: Option<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub width_range: Option<DimensionRange>,
    #[serde(default)]
    pub depth_range: Option<DimensionRange>,
    #[serde(default)]
    pub height_range: Option<DimensionRange>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    #[serde(default)]
    pub jan_code: Option<String>,
    pub platform: Platform,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl Item {
    pub fn is_active(&self) -> bool {
        self.status == ItemStatus::Active
    }

    /// Product code when known, otherwise the display name.
    pub fn ordering_key(&self) -> &str {
        match self.jan_code.as_deref() {
            Some(code) if !code.is_empty() => code,
            _ => &self.name,
        }
    }
}

/// One message on the durable channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub ordering_key: String,
    pub payload: String,
}

impl Envelope {
    pub fn from_item(item: &Item) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::now_v7().to_string(),
            ordering_key: item.ordering_key().to_string(),
            payload: serde_json::to_string(item)?,
        })
    }

    pub fn decode(&self) -> Result<Item, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub mod rakuten;
pub mod yahoo;

use crate::catalog::{CatalogError, CategoryChain, PlatformReference, TagClass};
use crate::dimensions::DimensionKind;
use crate::models::{DimensionRange, Platform};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unknown availability value `{0}`")]
    UnknownStatus(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("category lookup failed: {0}")]
    UnknownCategory(#[from] CatalogError),
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub platform: Platform,
    pub reference: &'a PlatformReference,
    pub queried_category: i64,
}

impl NormalizeContext<'_> {
    pub fn category(&self, marketplace_id: i64) -> Result<(i64, CategoryChain), NormalizeError> {
        Ok(self
            .reference
            .chain_for(marketplace_id, self.queried_category)?)
    }

    pub fn tags(&self, tag_ids: &[i64]) -> TagMetadata {
        classify_tags(self.reference, tag_ids)
    }
}

static JAN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^0-9])([0-9]{13})(?:[^0-9]|$)").expect("static JAN pattern")
});

/// First standalone 13-digit run across the given texts, in order.
pub fn scan_jan<'a>(fields: impl IntoIterator<Item = &'a str>) -> Option<String> {
    fields.into_iter().find_map(|text| {
        JAN_PATTERN
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Primary images then variant images, trimmed, blanks and repeats dropped.
pub fn merge_images<'a>(
    primary: impl IntoIterator<Item = &'a str>,
    variants: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    primary
        .into_iter()
        .chain(variants)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn require(value: &str, field: &'static str) -> Result<String, NormalizeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMetadata {
    pub brand: Option<String>,
    pub colors: Vec<String>,
    pub width: Option<DimensionRange>,
    pub depth: Option<DimensionRange>,
    pub height: Option<DimensionRange>,
}

/// First brand wins, colours accumulate, one range per dimension.
pub fn classify_tags(reference: &PlatformReference, tag_ids: &[i64]) -> TagMetadata {
    let mut meta = TagMetadata::default();
    for tag_id in tag_ids {
        match reference.tags.classify(&reference.vocabulary, *tag_id) {
            TagClass::Brand(name) => {
                if meta.brand.is_none() {
                    meta.brand = Some(name.to_string());
                }
            }
            TagClass::Color(name) => {
                if !meta.colors.iter().any(|c| c == name) {
                    meta.colors.push(name.to_string());
                }
            }
            TagClass::Dimension(kind, range) => {
                let slot = match kind {
                    DimensionKind::Width => &mut meta.width,
                    DimensionKind::Depth => &mut meta.depth,
                    DimensionKind::Height => &mut meta.height,
                };
                slot.get_or_insert(range);
            }
            TagClass::Other => {}
        }
    }
    meta
}

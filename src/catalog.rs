use crate::dimensions::{DimensionKind, range_from_tag_offset};
use crate::models::{DimensionRange, Platform};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("category {0} is not in the category table")]
    UnknownCategory(i64),
    #[error("category {0} has a cyclic parent chain")]
    Cycle(i64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

/// Root-first ancestor chain, ending with the category itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryChain {
    pub ids: Vec<i64>,
    pub names: Vec<String>,
}

/// Flat category table keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CategoryTable {
    by_id: HashMap<i64, CategoryRecord>,
}

impl CategoryTable {
    pub fn new(records: Vec<CategoryRecord>) -> Self {
        let by_id = records.into_iter().map(|r| (r.id, r)).collect();
        Self { by_id }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn get(&self, id: i64) -> Option<&CategoryRecord> {
        self.by_id.get(&id)
    }

    pub fn ancestors(&self, id: i64) -> Result<CategoryChain, CatalogError> {
        let mut chain = CategoryChain::default();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let record = self
                .by_id
                .get(&current)
                .ok_or(CatalogError::UnknownCategory(current))?;
            if chain.ids.len() > self.by_id.len() {
                return Err(CatalogError::Cycle(id));
            }
            chain.ids.push(record.id);
            chain.names.push(record.name.clone());
            cursor = record.parent_id.filter(|parent| *parent != record.id);
        }
        chain.ids.reverse();
        chain.names.reverse();
        Ok(chain)
    }

    pub fn is_root(&self, id: i64) -> bool {
        self.by_id
            .get(&id)
            .is_some_and(|record| record.parent_id.is_none_or(|parent| parent == record.id))
    }

    /// Top-level categories, ascending.
    pub fn roots(&self) -> Vec<i64> {
        let mut roots: Vec<i64> = self.by_id.keys().copied().filter(|id| self.is_root(*id)).collect();
        roots.sort_unstable();
        roots
    }
}

/// Marketplace category id -> canonical category id.
#[derive(Debug, Clone, Default)]
pub struct CategoryMapping {
    map: HashMap<i64, i64>,
}

impl CategoryMapping {
    pub fn new(map: HashMap<i64, i64>) -> Self {
        Self { map }
    }

    /// An empty mapping means the marketplace already uses canonical ids.
    pub fn canonical(&self, marketplace_id: i64) -> Option<i64> {
        if self.map.is_empty() {
            return Some(marketplace_id);
        }
        self.map.get(&marketplace_id).copied()
    }

    pub fn marketplace_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
}

/// Which tag groups carry brand/colour, and the "0-19 cm" base tag id
/// of each dimension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagVocabulary {
    #[serde(default)]
    pub brand_group_ids: Vec<i64>,
    #[serde(default)]
    pub color_group_ids: Vec<i64>,
    #[serde(default)]
    pub width_base_tag_id: Option<i64>,
    #[serde(default)]
    pub depth_base_tag_id: Option<i64>,
    #[serde(default)]
    pub height_base_tag_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagClass<'a> {
    Brand(&'a str),
    Color(&'a str),
    Dimension(DimensionKind, DimensionRange),
    Other,
}

#[derive(Debug, Clone, Default)]
pub struct TagTable {
    by_id: HashMap<i64, TagRecord>,
}

impl TagTable {
    pub fn new(records: Vec<TagRecord>) -> Self {
        Self {
            by_id: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn classify(&self, vocabulary: &TagVocabulary, tag_id: i64) -> TagClass<'_> {
        for (kind, base) in [
            (DimensionKind::Width, vocabulary.width_base_tag_id),
            (DimensionKind::Depth, vocabulary.depth_base_tag_id),
            (DimensionKind::Height, vocabulary.height_base_tag_id),
        ] {
            let Some(base) = base else { continue };
            if let Some(range) = range_from_tag_offset(tag_id - base) {
                return TagClass::Dimension(kind, range);
            }
        }

        let Some(record) = self.by_id.get(&tag_id) else {
            return TagClass::Other;
        };
        if vocabulary.brand_group_ids.contains(&record.group_id) {
            TagClass::Brand(&record.name)
        } else if vocabulary.color_group_ids.contains(&record.group_id) {
            TagClass::Color(&record.name)
        } else {
            TagClass::Other
        }
    }
}

/// Reference file layout (YAML).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub categories: Vec<CategoryRecord>,
    #[serde(default)]
    pub platforms: HashMap<String, PlatformSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformSection {
    #[serde(default)]
    pub category_map: HashMap<i64, i64>,
    #[serde(default)]
    pub harvest_categories: Vec<i64>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
    #[serde(default)]
    pub vocabulary: TagVocabulary,
}

/// Read-only lookups one marketplace needs; shared without locking.
#[derive(Debug, Clone, Default)]
pub struct PlatformReference {
    pub categories: Arc<CategoryTable>,
    pub mapping: CategoryMapping,
    pub tags: TagTable,
    pub vocabulary: TagVocabulary,
    harvest_categories: Vec<i64>,
}

impl PlatformReference {
    pub fn new(
        categories: Arc<CategoryTable>,
        mapping: CategoryMapping,
        tags: TagTable,
        vocabulary: TagVocabulary,
        harvest_categories: Vec<i64>,
    ) -> Self {
        Self {
            categories,
            mapping,
            tags,
            vocabulary,
            harvest_categories,
        }
    }

    pub fn from_reference(data: &ReferenceData, platform: Platform) -> Self {
        let categories = Arc::new(CategoryTable::new(data.categories.clone()));
        let section = data
            .platforms
            .get(platform.as_str())
            .cloned()
            .unwrap_or_default();
        Self::new(
            categories,
            CategoryMapping::new(section.category_map),
            TagTable::new(section.tags),
            section.vocabulary,
            section.harvest_categories,
        )
    }

    /// Marketplace category ids to crawl: the explicit list, else the
    /// marketplace ids of root categories. A mapping with no root entries
    /// crawls every mapped id; no mapping at all crawls the table's roots.
    pub fn harvest_categories(&self) -> Vec<i64> {
        if !self.harvest_categories.is_empty() {
            let mut ids = self.harvest_categories.clone();
            ids.sort_unstable();
            ids.dedup();
            return ids;
        }
        let mapped = self.mapping.marketplace_ids();
        if mapped.is_empty() {
            return self.categories.roots();
        }
        let roots: Vec<i64> = mapped
            .iter()
            .copied()
            .filter(|id| {
                self.mapping
                    .canonical(*id)
                    .is_some_and(|canonical| self.categories.is_root(canonical))
            })
            .collect();
        if roots.is_empty() { mapped } else { roots }
    }

    /// Canonical chain for a marketplace category, trying `fallback` when
    /// the item's own category is unmapped.
    pub fn chain_for(
        &self,
        marketplace_id: i64,
        fallback: i64,
    ) -> Result<(i64, CategoryChain), CatalogError> {
        let canonical = self
            .mapping
            .canonical(marketplace_id)
            .filter(|id| self.categories.get(*id).is_some())
            .or_else(|| self.mapping.canonical(fallback))
            .ok_or(CatalogError::UnknownCategory(marketplace_id))?;
        let chain = self.categories.ancestors(canonical)?;
        Ok((canonical, chain))
    }
}

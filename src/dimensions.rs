use crate::models::{DimensionRange, Item};
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct DimensionBand {
    pub label: &'static str,
    pub gte: i32,
    pub lte: Option<i32>,
}

const fn band_of(label: &'static str, gte: i32, lte: Option<i32>) -> DimensionBand {
    DimensionBand { label, gte, lte }
}

/// Facet bands, ordered. The first band is 20 cm wide, the rest 10 cm,
/// and the last one is open ended.
pub const DIMENSION_BANDS: [DimensionBand; 20] = [
    band_of("~19cm", 0, Some(19)),
    band_of("20~29cm", 20, Some(29)),
    band_of("30~39cm", 30, Some(39)),
    band_of("40~49cm", 40, Some(49)),
    band_of("50~59cm", 50, Some(59)),
    band_of("60~69cm", 60, Some(69)),
    band_of("70~79cm", 70, Some(79)),
    band_of("80~89cm", 80, Some(89)),
    band_of("90~99cm", 90, Some(99)),
    band_of("100~109cm", 100, Some(109)),
    band_of("110~119cm", 110, Some(119)),
    band_of("120~129cm", 120, Some(129)),
    band_of("130~139cm", 130, Some(139)),
    band_of("140~149cm", 140, Some(149)),
    band_of("150~159cm", 150, Some(159)),
    band_of("160~169cm", 160, Some(169)),
    band_of("170~179cm", 170, Some(179)),
    band_of("180~189cm", 180, Some(189)),
    band_of("190~199cm", 190, Some(199)),
    band_of("200cm~", 200, None),
];

impl DimensionBand {
    pub fn range(&self) -> DimensionRange {
        DimensionRange::new(self.gte, self.lte)
    }

    fn contains(&self, value: i32) -> bool {
        self.range().contains(value)
    }
}

/// Maps a `(gte, lte)` pair to its facet label, or `""` when no band fits.
pub fn band(gte: i32, lte: Option<i32>) -> &'static str {
    if let Some(exact) = DIMENSION_BANDS
        .iter()
        .find(|band| band.gte == gte && band.lte == lte)
    {
        return exact.label;
    }
    DIMENSION_BANDS
        .iter()
        .find(|band| band.contains(gte))
        .map(|band| band.label)
        .unwrap_or("")
}

/// Decodes a dimension tag as an offset from the "0-19 cm" base tag id.
pub fn range_from_tag_offset(offset: i64) -> Option<DimensionRange> {
    let index = usize::try_from(offset).ok()?;
    DIMENSION_BANDS.get(index).map(DimensionBand::range)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKind {
    Width,
    Depth,
    Height,
}

impl DimensionKind {
    pub fn facet_name(&self) -> &'static str {
        match self {
            DimensionKind::Width => "width",
            DimensionKind::Depth => "depth",
            DimensionKind::Height => "height",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataFacet {
    pub name: String,
    pub value: String,
}

/// One `{name, value}` facet per dimension band present on the item.
pub fn dimension_facets(item: &Item) -> Vec<MetadataFacet> {
    [
        (DimensionKind::Width, item.width_range),
        (DimensionKind::Depth, item.depth_range),
        (DimensionKind::Height, item.height_range),
    ]
    .into_iter()
    .filter_map(|(kind, range)| {
        let range = range?;
        let label = band(range.gte, range.lte);
        if label.is_empty() {
            return None;
        }
        Some(MetadataFacet {
            name: kind.facet_name().to_string(),
            value: label.to_string(),
        })
    })
    .collect()
}

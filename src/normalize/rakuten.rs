use crate::marketplace::rakuten::RakutenItem;
use crate::models::{Item, ItemStatus};
use crate::normalize::{NormalizeContext, NormalizeError, merge_images, require, scan_jan};

pub fn normalize(raw: RakutenItem, ctx: NormalizeContext<'_>) -> Result<Item, NormalizeError> {
    let source_id = require(&raw.item_code, "itemCode")?;
    let name = require(&raw.item_name, "itemName")?;
    let url = require(&raw.item_url, "itemUrl")?;
    let status = match raw.availability {
        Some(1) => ItemStatus::Active,
        Some(0) => ItemStatus::Inactive,
        Some(other) => return Err(NormalizeError::UnknownStatus(other.to_string())),
        None => return Err(NormalizeError::UnknownStatus("missing".into())),
    };
    let (category_id, chain) = ctx.category(raw.genre_id)?;
    let tags = ctx.tags(&raw.tag_ids);

    let image_urls = merge_images(
        raw.medium_image_urls.iter().map(|u| strip_thumbnail(u)),
        raw.small_image_urls.iter().map(|u| strip_thumbnail(u)),
    );
    let jan_code = scan_jan([
        raw.item_name.as_str(),
        raw.catchcopy.as_str(),
        raw.item_caption.as_str(),
    ]);

    Ok(Item {
        id: ctx.platform.unique_id(&source_id),
        name,
        description: raw.item_caption.trim().to_string(),
        status,
        url,
        affiliate_url: raw.affiliate_url.filter(|u| !u.trim().is_empty()),
        price: raw.item_price,
        image_urls,
        average_rating: raw.review_average,
        review_count: raw.review_count,
        category_id,
        category_name: chain.names.last().cloned(),
        category_ids: chain.ids,
        category_names: chain.names,
        brand_name: tags.brand,
        colors: tags.colors,
        width_range: tags.width,
        depth_range: tags.depth,
        height_range: tags.height,
        tag_ids: raw.tag_ids,
        jan_code,
        platform: ctx.platform,
        group_id: None,
    })
}

/// Drops the `?_ex=WxH` thumbnail sizing so the full image is referenced.
fn strip_thumbnail(url: &str) -> &str {
    match url.find("?_ex=") {
        Some(idx) => &url[..idx],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogError;
    use crate::dimensions::dimension_facets;
    use crate::models::{DimensionRange, Platform};
    use crate::testing::furniture_reference;

    fn raw() -> RakutenItem {
        serde_json::from_value(serde_json::json!({
            "itemName": "Acme standing desk 120cm",
            "catchcopy": "JAN 4901234567894",
            "itemCode": "acme-shop:10000001",
            "itemPrice": 25800,
            "itemCaption": "Solid oak top.",
            "itemUrl": "https://item.rakuten.co.jp/acme-shop/10000001/",
            "affiliateUrl": "",
            "availability": 1,
            "mediumImageUrls": [
                "https://thumbnail.image.rakuten.co.jp/a.jpg?_ex=128x128",
                "https://thumbnail.image.rakuten.co.jp/b.jpg?_ex=128x128"
            ],
            "smallImageUrls": ["https://thumbnail.image.rakuten.co.jp/a.jpg?_ex=64x64"],
            "reviewCount": 12,
            "reviewAverage": "4.25",
            "shopCode": "acme-shop",
            "genreId": "215567",
            "tagIds": [1000, 2001, 5011, 5203]
        }))
        .expect("raw item")
    }

    fn ctx(reference: &crate::catalog::PlatformReference) -> NormalizeContext<'_> {
        NormalizeContext {
            platform: Platform::Rakuten,
            reference,
            queried_category: 215566,
        }
    }

    #[test]
    fn maps_a_full_record() {
        let reference = furniture_reference();
        let item = normalize(raw(), ctx(&reference)).expect("item");
        assert_eq!(item.id, "rakuten:acme-shop:10000001");
        assert!(item.is_active());
        assert_eq!(item.category_id, 100);
        assert_eq!(item.category_ids, vec![1, 10, 100]);
        assert_eq!(item.category_name.as_deref(), Some("Standing Desks"));
        assert_eq!(
            item.image_urls,
            vec![
                "https://thumbnail.image.rakuten.co.jp/a.jpg",
                "https://thumbnail.image.rakuten.co.jp/b.jpg"
            ]
        );
        assert_eq!(item.jan_code.as_deref(), Some("4901234567894"));
        assert_eq!(item.brand_name.as_deref(), Some("Acme"));
        assert_eq!(item.colors, vec!["White"]);
        assert_eq!(item.width_range, Some(DimensionRange::new(120, Some(129))));
        assert_eq!(item.height_range, Some(DimensionRange::new(40, Some(49))));
        assert_eq!(item.affiliate_url, None);
        assert_eq!(item.average_rating, 4.25);
        assert_eq!(dimension_facets(&item).len(), 2);
    }

    #[test]
    fn unknown_availability_fails_the_item() {
        let reference = furniture_reference();
        let mut raw = raw();
        raw.availability = Some(2);
        assert_eq!(
            normalize(raw, ctx(&reference)),
            Err(NormalizeError::UnknownStatus("2".into()))
        );
    }

    #[test]
    fn unmapped_genre_uses_the_queried_category() {
        let reference = furniture_reference();
        let mut raw = raw();
        raw.genre_id = 999_999;
        let item = normalize(raw, ctx(&reference)).expect("item");
        assert_eq!(item.category_id, 10);

        let mut raw = self::raw();
        raw.genre_id = 999_999;
        let lost = NormalizeContext {
            queried_category: 888_888,
            ..ctx(&reference)
        };
        assert_eq!(
            normalize(raw, lost),
            Err(NormalizeError::UnknownCategory(CatalogError::UnknownCategory(999_999)))
        );
    }

    #[test]
    fn missing_code_fails_the_item() {
        let reference = furniture_reference();
        let mut raw = raw();
        raw.item_code = " ".into();
        assert_eq!(
            normalize(raw, ctx(&reference)),
            Err(NormalizeError::MissingField("itemCode"))
        );
    }
}

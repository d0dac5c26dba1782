use crate::marketplace::yahoo::YahooHit;
use crate::models::{Item, ItemStatus};
use crate::normalize::{NormalizeContext, NormalizeError, merge_images, require, scan_jan};

pub fn normalize(raw: YahooHit, ctx: NormalizeContext<'_>) -> Result<Item, NormalizeError> {
    let source_id = require(&raw.code, "code")?;
    let name = require(&raw.name, "name")?;
    let url = require(&raw.url, "url")?;
    let status = match raw.in_stock {
        Some(true) => ItemStatus::Active,
        Some(false) => ItemStatus::Inactive,
        None => return Err(NormalizeError::UnknownStatus("missing inStock".into())),
    };

    let genre_id = raw
        .genre_category
        .as_ref()
        .map(|genre| genre.id)
        .unwrap_or(ctx.queried_category);
    let (category_id, chain) = ctx.category(genre_id)?;

    let image_urls = merge_images(
        raw.ex_image.as_ref().map(|img| img.url.as_str()),
        raw.image.medium.as_deref(),
    );
    let jan_code = raw
        .jan_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
        .or_else(|| {
            scan_jan([
                raw.name.as_str(),
                raw.description.as_str(),
                raw.head_line.as_str(),
            ])
        });
    let brand_name = raw
        .brand
        .and_then(|brand| brand.name)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    Ok(Item {
        id: ctx.platform.unique_id(&source_id),
        name,
        description: raw.description.trim().to_string(),
        status,
        url,
        affiliate_url: raw.affiliate_url.filter(|u| !u.trim().is_empty()),
        price: raw.price,
        image_urls,
        average_rating: raw.review.rate,
        review_count: raw.review.count,
        category_id,
        category_ids: chain.ids,
        category_names: chain.names,
        category_name: raw.genre_category.map(|genre| genre.name),
        brand_name,
        colors: Vec::new(),
        width_range: None,
        depth_range: None,
        height_range: None,
        tag_ids: Vec::new(),
        jan_code,
        platform: ctx.platform,
        group_id: None,
    })
}

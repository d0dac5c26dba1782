use crate::marketplace::{FetchError, Marketplace, PageQuery, RawListing};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub category_id: i64,
    pub current_page: u32,
    pub current_min_price: i64,
    pub max_price: i64,
    pub done: bool,
}

/// Walks one category in ascending price order, re-flooring the price
/// filter whenever the API's page ceiling is hit. Owned by one worker.
///
/// Items tied at a rebucket price in numbers larger than the page ceiling
/// allows are skipped; counts downstream depend on this.
pub struct PriceCursor<'a, M: Marketplace> {
    source: &'a M,
    worker: usize,
    state: CursorState,
}

impl<'a, M: Marketplace> PriceCursor<'a, M> {
    pub fn new(source: &'a M, worker: usize, category_id: i64, min_price: i64, max_price: i64) -> Self {
        Self {
            source,
            worker,
            state: CursorState {
                category_id,
                current_page: 1,
                current_min_price: min_price,
                max_price,
                done: false,
            },
        }
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    /// Fetches the next page. Returns the items at or below `max_price` and
    /// whether the category is exhausted.
    pub async fn next(&mut self) -> Result<(Vec<M::Raw>, bool), FetchError> {
        if self.state.done {
            return Ok((Vec::new(), true));
        }
        let query = PageQuery {
            category_id: self.state.category_id,
            min_price: self.state.current_min_price,
            page: self.state.current_page,
        };
        let page = self.source.fetch_page(self.worker, &query).await?;
        let mut items = page.items;

        if items.is_empty() {
            self.state.done = true;
            return Ok((items, true));
        }

        if let Some(crossing) = items
            .iter()
            .position(|item| item.price() > self.state.max_price)
        {
            items.truncate(crossing);
            self.state.done = true;
            return Ok((items, true));
        }

        if items.len() as u64 == page.total_count {
            self.state.done = true;
        } else if self.state.current_page >= self.source.page_ceiling() {
            let last_price = items
                .last()
                .map(RawListing::price)
                .unwrap_or(self.state.current_min_price);
            let floor = if last_price <= self.state.current_min_price {
                self.state.current_min_price + 1
            } else {
                last_price
            };
            debug!(
                target = "harvester.cursor",
                category_id = self.state.category_id,
                previous_floor = self.state.current_min_price,
                floor,
                "rebucket"
            );
            self.state.current_min_price = floor;
            self.state.current_page = 1;
        } else {
            self.state.current_page += 1;
        }
        Ok((items, self.state.done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeListing, FakeMarketplace};
    use std::collections::BTreeSet;

    async fn drain(source: &FakeMarketplace, category: i64, max_price: i64) -> (BTreeSet<String>, usize) {
        let mut cursor = PriceCursor::new(source, 0, category, 0, max_price);
        let mut seen = BTreeSet::new();
        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps < 10_000, "cursor did not terminate");
            let (items, done) = cursor.next().await.expect("page");
            assert!(items.iter().all(|item| item.price <= max_price));
            seen.extend(items.into_iter().map(|item| item.id));
            if done {
                break;
            }
        }
        (seen, steps)
    }

    #[tokio::test]
    async fn covers_every_item_up_to_the_ceiling() {
        // At most two items share a price, well under one bucket.
        let listings: Vec<FakeListing> = (0..400)
            .map(|i| FakeListing::new(format!("item-{i:03}"), 100 + (i * 37 % 200)))
            .collect();
        let max_price = 280;
        let expected: BTreeSet<String> = listings
            .iter()
            .filter(|l| l.price <= max_price)
            .map(|l| l.id.clone())
            .collect();
        let source = FakeMarketplace::new(10, 3).with_category(7, listings);

        let (seen, steps) = drain(&source, 7, max_price).await;
        assert_eq!(seen, expected);
        assert!(steps > 3, "expected at least one rebucket");
    }

    #[tokio::test]
    async fn price_plateau_beyond_one_bucket_loses_items() {
        let mut listings: Vec<FakeListing> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| FakeListing::new(*id, 100))
            .collect();
        listings.push(FakeListing::new("f", 200));
        let source = FakeMarketplace::new(2, 2).with_category(1, listings);

        let (seen, _) = drain(&source, 1, 1_000).await;
        let expected: BTreeSet<String> =
            ["a", "b", "c", "d", "f"].iter().map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn crossing_the_ceiling_truncates_and_stops() {
        let listings = vec![
            FakeListing::new("cheap", 100),
            FakeListing::new("mid", 500),
            FakeListing::new("dear", 900),
        ];
        let source = FakeMarketplace::new(10, 5).with_category(3, listings);
        let mut cursor = PriceCursor::new(&source, 0, 3, 0, 600);
        let (items, done) = cursor.next().await.expect("page");
        assert!(done);
        assert_eq!(items.len(), 2);
        assert!(cursor.state().done);
        let (items, done) = cursor.next().await.expect("finished cursor");
        assert!(items.is_empty() && done);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn full_result_in_one_page_is_done() {
        let listings = vec![FakeListing::new("x", 10), FakeListing::new("y", 20)];
        let source = FakeMarketplace::new(10, 5).with_category(3, listings);
        let (seen, steps) = drain(&source, 3, 1_000).await;
        assert_eq!(seen.len(), 2);
        assert_eq!(steps, 1);
    }

    #[tokio::test]
    async fn pages_advance_then_end_on_an_empty_page() {
        let listings = (0..5).map(|i| FakeListing::new(format!("p{i}"), 10 * i)).collect();
        let source = FakeMarketplace::new(2, 10).with_category(4, listings);
        let mut cursor = PriceCursor::new(&source, 0, 4, 0, 1_000);
        cursor.next().await.expect("page 1");
        assert_eq!(cursor.state().current_page, 2);
        cursor.next().await.expect("page 2");
        let (items, done) = cursor.next().await.expect("page 3");
        assert_eq!(items.len(), 1);
        assert!(!done);
        let (items, done) = cursor.next().await.expect("page 4");
        assert!(items.is_empty() && done);
    }

    #[tokio::test]
    async fn fetch_errors_reach_the_caller() {
        let source = FakeMarketplace::new(2, 2)
            .with_failure(9, FetchError::Rejected("HTTP 400".into()));
        let mut cursor = PriceCursor::new(&source, 0, 9, 0, 100);
        assert_eq!(
            cursor.next().await.map(|(items, _)| items.len()),
            Err(FetchError::Rejected("HTTP 400".into()))
        );
        assert!(!cursor.state().done);
    }
}

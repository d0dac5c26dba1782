use crate::models::Platform;
use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

// Thin wrappers over the `metrics` facade so call sites stay one line and
// label sets stay consistent. Without an installed recorder they are no-ops.

pub fn page_fetched(platform: Platform) {
    counter!("harvester_pages_fetched_total", "platform" => platform.as_str()).increment(1);
}

pub fn fetch_retry(platform: Platform) {
    counter!("harvester_fetch_retries_total", "platform" => platform.as_str()).increment(1);
}

pub fn items_published(count: usize) {
    counter!("harvester_items_published_total").increment(count as u64);
}

pub fn items_rejected(platform: Platform, count: usize) {
    counter!("harvester_items_rejected_total", "platform" => platform.as_str())
        .increment(count as u64);
}

pub fn publish_failures(count: usize) {
    counter!("harvester_publish_failures_total").increment(count as u64);
}

pub fn batch_outcome(outcome: &'static str) {
    counter!("harvester_batches_total", "outcome" => outcome).increment(1);
}

pub fn group_minted() {
    counter!("harvester_groups_minted_total").increment(1);
}

pub fn group_matched(rule: &'static str) {
    counter!("harvester_groups_matched_total", "rule" => rule).increment(1);
}

pub fn category_elapsed(platform: Platform, elapsed: Duration) {
    histogram!("harvester_category_seconds", "platform" => platform.as_str())
        .record(elapsed.as_secs_f64());
    trace!(
        target = "harvester.metrics",
        platform = platform.as_str(),
        elapsed_ms = elapsed.as_millis() as u64,
        "category_elapsed"
    );
}

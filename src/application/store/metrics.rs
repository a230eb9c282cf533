//! Metric names emitted by the store.

use metrics::counter;

pub const METRIC_CACHE_HIT: &str = "blendstore_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "blendstore_cache_miss_total";
pub const METRIC_INDEX_REBUILD: &str = "blendstore_index_rebuild_total";
pub const METRIC_LIST_MATERIALIZE: &str = "blendstore_list_materialize_total";
pub const METRIC_WRITE_RETRY: &str = "blendstore_write_retry_total";
pub const METRIC_WRITE_FAILED: &str = "blendstore_write_failed_total";
pub const METRIC_WRITE_MS: &str = "blendstore_write_ms";

pub(crate) fn count(name: &'static str, entity: &str) {
    counter!(name, "entity" => entity.to_string()).increment(1);
}

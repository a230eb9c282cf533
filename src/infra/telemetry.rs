use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::store::metrics::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_INDEX_REBUILD, METRIC_LIST_MATERIALIZE,
    METRIC_WRITE_FAILED, METRIC_WRITE_MS, METRIC_WRITE_RETRY,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every store metric with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Reads answered from a cached primary hash."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Reads that fell through to the backing store."
        );
        describe_counter!(
            METRIC_INDEX_REBUILD,
            Unit::Count,
            "Index delete-then-rebuild cycles after field updates."
        );
        describe_counter!(
            METRIC_LIST_MATERIALIZE,
            Unit::Count,
            "Full scans that materialized an all-keys list."
        );
        describe_counter!(
            METRIC_WRITE_RETRY,
            Unit::Count,
            "Detached backing-store writes retried after a transient failure."
        );
        describe_counter!(
            METRIC_WRITE_FAILED,
            Unit::Count,
            "Detached backing-store writes abandoned after exhausting retries."
        );
        describe_histogram!(
            METRIC_WRITE_MS,
            Unit::Milliseconds,
            "Backing-store write latency in milliseconds."
        );
    });
}

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "strata_cache_local_hit_total",
            Unit::Count,
            "Lookups answered by the local tier."
        );
        describe_counter!(
            "strata_cache_local_miss_total",
            Unit::Count,
            "Hot-key lookups that missed the local tier."
        );
        describe_counter!(
            "strata_cache_local_evict_total",
            Unit::Count,
            "Local entries evicted due to capacity."
        );
        describe_counter!(
            "strata_cache_remote_hit_total",
            Unit::Count,
            "Lookups answered by the remote store."
        );
        describe_counter!(
            "strata_cache_remote_miss_total",
            Unit::Count,
            "Lookups that missed the remote store."
        );
        describe_counter!(
            "strata_cache_sweep_removed_total",
            Unit::Count,
            "Expired local entries removed by sweeps."
        );
        describe_counter!(
            "strata_remote_slow_total",
            Unit::Count,
            "Remote commands slower than the configured threshold."
        );
        describe_histogram!(
            "strata_query_db_ms",
            Unit::Milliseconds,
            "Database execution latency of optimized queries."
        );
        describe_counter!(
            "strata_query_slow_total",
            Unit::Count,
            "Optimized queries slower than the slow-query threshold."
        );
        describe_counter!(
            "strata_query_cache_hit_total",
            Unit::Count,
            "Optimized queries answered from a cache tier."
        );
        describe_gauge!(
            "strata_db_pool_connections",
            Unit::Count,
            "Open database connections at the last health check."
        );
        describe_gauge!(
            "strata_db_pool_idle",
            Unit::Count,
            "Idle database connections at the last health check."
        );
    });
}

use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
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
        .map_err(|err| AppError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "gantry_cache_hit_total",
            Unit::Count,
            "Cache lookups answered by a live entry, labelled by backend."
        );
        describe_counter!(
            "gantry_cache_miss_total",
            Unit::Count,
            "Cache lookups that found no live entry, labelled by backend."
        );
        describe_counter!(
            "gantry_cache_expired_total",
            Unit::Count,
            "Entries evicted on access after their TTL elapsed."
        );
        describe_counter!(
            "gantry_session_created_total",
            Unit::Count,
            "Sessions started with a fresh id."
        );
        describe_counter!(
            "gantry_session_swept_total",
            Unit::Count,
            "Stored sessions removed by the expiry sweep."
        );
    });
}

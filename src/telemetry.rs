use crate::metrics::{
    EVENT_PROCESSING_TIME_METRIC, EVENT_QUEUE_TIME_METRIC, THREAD_IDLE_TIME_METRIC,
};
use thiserror::Error;

/// Errors surfaced while validating `/metrics` exposition text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    /// Encountered a metric that still emits `_seconds`.
    #[error("metric '{name}' must emit `_ms` suffixed values")]
    NonMsMetric { name: String },
    /// A runtime metric family is absent from the exposition.
    #[error("metric family '{name}' is missing from the exposition")]
    MissingMetric { name: String },
}

/// Metric families every processor exposition must carry.
pub const RUNTIME_METRIC_FAMILIES: [&str; 3] = [
    EVENT_QUEUE_TIME_METRIC,
    EVENT_PROCESSING_TIME_METRIC,
    THREAD_IDLE_TIME_METRIC,
];

/// Ensures timing metrics are reported in milliseconds only.
pub fn ensure_ms_only_metrics(exposition: &str) -> Result<(), TelemetryError> {
    for name in scrape_metric_names(exposition) {
        if name.ends_with("_seconds") {
            return Err(TelemetryError::NonMsMetric { name });
        }
    }
    Ok(())
}

/// Validates an exposition rendered by [`crate::RuntimeMetrics`].
pub fn validate_runtime_exposition(exposition: &str) -> Result<(), TelemetryError> {
    ensure_ms_only_metrics(exposition)?;
    let names = scrape_metric_names(exposition);
    for family in RUNTIME_METRIC_FAMILIES {
        if !names.iter().any(|name| name.starts_with(family)) {
            return Err(TelemetryError::MissingMetric {
                name: family.to_string(),
            });
        }
    }
    Ok(())
}

/// Extracts metric names (without labels) from Prometheus exposition text.
pub fn scrape_metric_names(exposition: &str) -> Vec<String> {
    exposition
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let mut parts = trimmed.split(|c: char| c == '{' || c.is_whitespace());
            parts
                .next()
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
        })
        .collect()
}

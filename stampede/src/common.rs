//! Helpers shared by the stampede components
//!
//! Metric label sets and conversion between wall-clock time and event
//! timestamps in the run's resolution.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stampede_stats::Resolution;

/// Builds the label set attached to a component's metrics.
#[derive(Debug, Clone)]
pub(crate) struct MetricsBuilder {
    labels: Vec<(String, String)>,
}

impl MetricsBuilder {
    /// Create a new metrics builder with standard component labels
    pub(crate) fn new(component: &str, component_name: &str) -> Self {
        Self {
            labels: vec![
                ("component".to_string(), component.to_string()),
                ("component_name".to_string(), component_name.to_string()),
            ],
        }
    }

    /// Add a custom label
    pub(crate) fn with_label(mut self, key: &str, value: impl ToString) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    /// Build the final label vector
    pub(crate) fn build(self) -> Vec<(String, String)> {
        self.labels
    }
}

/// Wall clock time since the Unix epoch in `resolution`, saturating.
pub(crate) fn now(resolution: Resolution) -> u64 {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ticks = match resolution {
        Resolution::Millis => since.as_millis(),
        Resolution::Nanos => since.as_nanos(),
    };
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// Convert a timestamp in `resolution` to a duration since the epoch.
pub(crate) fn to_duration(timestamp: u64, resolution: Resolution) -> Duration {
    match resolution {
        Resolution::Millis => Duration::from_millis(timestamp),
        Resolution::Nanos => Duration::from_nanos(timestamp),
    }
}

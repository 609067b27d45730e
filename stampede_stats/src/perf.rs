//! Point-in-time performance snapshots.

use std::cmp::Ordering;

use serde::Serialize;

use crate::{counters::OutStreamCounters, stream::Stream};

#[derive(Debug, Clone, Serialize)]
/// One stream's statistics at one timestamp bucket.
///
/// Throughputs are results per second, response times milliseconds.
/// Undefined values are NaN and serialize as `null`. Snapshots compare and
/// order by `(timestamp, stream)` only.
pub struct PerformanceStats {
    /// Start of the bucket, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The stream described.
    pub stream: Stream,
    /// Results since the run started.
    pub total_count: u64,
    /// Results in this bucket.
    pub interval_count: u64,
    /// Mean throughput since the run started.
    pub avg_throughput: f64,
    /// Lowest bucket throughput so far.
    pub min_throughput: f64,
    /// Highest bucket throughput so far.
    pub max_throughput: f64,
    /// Throughput of this bucket.
    pub last_throughput: f64,
    /// Mean response time.
    pub avg_rt: f64,
    /// Smallest response time.
    pub min_rt: f64,
    /// Largest response time.
    pub max_rt: f64,
    /// Sample standard deviation of response time.
    pub stdev_rt: f64,
    /// Most recent response time.
    pub last_rt: f64,
    /// Response time histogram, bucket upper bound to frequency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Vec<(f64, f64)>>,
}

impl PerformanceStats {
    /// Derive a snapshot from `counters` whose current interval is closed.
    /// `elapsed_secs` is the time since the run started.
    #[must_use]
    pub fn from_counters(
        timestamp: u64,
        stream: Stream,
        counters: &OutStreamCounters,
        elapsed_secs: f64,
    ) -> Self {
        let avg_throughput = if elapsed_secs > 0.0 {
            counters.total_count() as f64 / elapsed_secs
        } else {
            f64::NAN
        };
        Self {
            timestamp,
            stream,
            total_count: counters.total_count(),
            interval_count: counters.last_count(),
            avg_throughput,
            min_throughput: counters.min_throughput().unwrap_or(f64::NAN),
            max_throughput: counters.max_throughput().unwrap_or(f64::NAN),
            last_throughput: counters.last_throughput().unwrap_or(f64::NAN),
            avg_rt: counters.avg_rt(),
            min_rt: counters.min_rt().unwrap_or(f64::NAN),
            max_rt: counters.max_rt().unwrap_or(f64::NAN),
            stdev_rt: counters.stdev_rt(),
            last_rt: counters.last_rt().unwrap_or(f64::NAN),
            histogram: None,
        }
    }
}

impl PartialEq for PerformanceStats {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.stream == other.stream
    }
}

impl Eq for PerformanceStats {}

impl PartialOrd for PerformanceStats {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PerformanceStats {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.stream.cmp(&other.stream))
    }
}

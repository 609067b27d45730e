//! Per-stream running statistics.
//!
//! Response times are kept in milliseconds as running sums, never as raw
//! samples. Values that are undefined for the samples seen so far, the
//! standard deviation of fewer than two samples for instance, are reported as
//! NaN.

use serde::{Deserialize, Serialize};

const NANOS_PER_MILLI: f64 = 1_000_000.0;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Resolution of the timestamps offered to the counters.
pub enum Resolution {
    /// Milliseconds
    #[default]
    Millis,
    /// Nanoseconds
    Nanos,
}

impl Resolution {
    /// Convert a timestamp delta in this resolution to milliseconds.
    #[must_use]
    pub fn to_millis(self, delta: f64) -> f64 {
        match self {
            Resolution::Millis => delta,
            Resolution::Nanos => delta / NANOS_PER_MILLI,
        }
    }
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
/// Online statistics for one output stream.
pub struct OutStreamCounters {
    total_count: u64,
    last_count: u64,
    sum_rt: f64,
    sum_sqr_rt: f64,
    min_rt: Option<f64>,
    max_rt: Option<f64>,
    last_rt: Option<f64>,
    min_throughput: Option<f64>,
    max_throughput: Option<f64>,
    last_throughput: Option<f64>,
}

impl OutStreamCounters {
    /// Record one result whose event entered at `input_ts` and left at
    /// `output_ts`, both in `resolution`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn offer(&mut self, input_ts: u64, output_ts: u64, resolution: Resolution) {
        // Subtract before converting, nanosecond epochs exceed f64 precision.
        let delta = (i128::from(output_ts) - i128::from(input_ts)) as f64;
        self.offer_rt(resolution.to_millis(delta));
    }

    /// Record one response time, already in milliseconds.
    pub fn offer_rt(&mut self, rt: f64) {
        self.total_count += 1;
        self.last_count += 1;
        self.sum_rt += rt;
        self.sum_sqr_rt += rt * rt;
        self.min_rt = Some(self.min_rt.map_or(rt, |m| m.min(rt)));
        self.max_rt = Some(self.max_rt.map_or(rt, |m| m.max(rt)));
        self.last_rt = Some(rt);
    }

    /// Close a reporting interval that lasted `seconds`, folding its
    /// throughput into the minimum and maximum seen so far.
    pub fn close_interval(&mut self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        let throughput = self.last_count as f64 / seconds;
        self.min_throughput = Some(self.min_throughput.map_or(throughput, |m| m.min(throughput)));
        self.max_throughput = Some(self.max_throughput.map_or(throughput, |m| m.max(throughput)));
        self.last_throughput = Some(throughput);
    }

    /// Zero the interval count. Cumulative totals are kept.
    pub fn reset(&mut self) {
        self.last_count = 0;
    }

    /// Results recorded since creation.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Results recorded since the last [`OutStreamCounters::reset`].
    #[must_use]
    pub fn last_count(&self) -> u64 {
        self.last_count
    }

    /// Mean response time, NaN with no results.
    #[must_use]
    pub fn avg_rt(&self) -> f64 {
        if self.total_count == 0 {
            return f64::NAN;
        }
        self.sum_rt / self.total_count as f64
    }

    /// Sample standard deviation of response time, NaN with fewer than two
    /// results.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn stdev_rt(&self) -> f64 {
        if self.total_count <= 1 {
            return f64::NAN;
        }
        if self.min_rt == self.max_rt {
            return 0.0;
        }
        let n = self.total_count as f64;
        let variance = (self.sum_sqr_rt - self.sum_rt * self.sum_rt / n) / (n - 1.0);
        variance.max(0.0).sqrt()
    }

    /// Smallest response time.
    #[must_use]
    pub fn min_rt(&self) -> Option<f64> {
        self.min_rt
    }

    /// Largest response time.
    #[must_use]
    pub fn max_rt(&self) -> Option<f64> {
        self.max_rt
    }

    /// Most recent response time.
    #[must_use]
    pub fn last_rt(&self) -> Option<f64> {
        self.last_rt
    }

    /// Sum of response times.
    #[must_use]
    pub fn sum_rt(&self) -> f64 {
        self.sum_rt
    }

    /// Lowest interval throughput, results per second.
    #[must_use]
    pub fn min_throughput(&self) -> Option<f64> {
        self.min_throughput
    }

    /// Highest interval throughput, results per second.
    #[must_use]
    pub fn max_throughput(&self) -> Option<f64> {
        self.max_throughput
    }

    /// Throughput of the most recently closed interval.
    #[must_use]
    pub fn last_throughput(&self) -> Option<f64> {
        self.last_throughput
    }
}

//! Shared statistics recorder.
//!
//! A [`Recorder`] is cheap to clone and every clone shares one
//! [`SinkPerfStats`]. Offers and snapshots take the same lock, so a snapshot
//! never sees a counter half updated and no offer is lost between the copy
//! and the reset that follows it.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    counters::Resolution,
    histogram::{self, Histogram},
    perf::PerformanceStats,
    sink::SinkPerfStats,
    stream::Stream,
};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
/// Shape of the per-stream response time histograms.
pub struct HistogramConfig {
    /// Lower bound of the range, milliseconds.
    pub min: f64,
    /// Upper bound of the range, milliseconds.
    pub max: f64,
    /// Number of buckets including underflow and overflow.
    pub buckets: usize,
    /// Report cumulative frequencies.
    #[serde(default)]
    pub cumulative: bool,
}

impl HistogramConfig {
    /// Build an empty histogram of this shape.
    ///
    /// # Errors
    ///
    /// See [`Histogram::with_bucket_count`].
    pub fn build(&self) -> Result<Histogram, histogram::Error> {
        Ok(Histogram::with_bucket_count(self.min, self.max, self.buckets)?.cumulative(self.cumulative))
    }
}

#[derive(Debug, Default)]
struct State {
    stats: SinkPerfStats,
    histograms: FxHashMap<Stream, Histogram>,
}

#[derive(Debug, Clone)]
/// Thread-safe handle onto a shared [`SinkPerfStats`].
pub struct Recorder {
    state: Arc<Mutex<State>>,
    resolution: Resolution,
    histogram: Option<Histogram>,
}

impl Recorder {
    /// Create a new [`Recorder`] for timestamps in `resolution`.
    #[must_use]
    pub fn new(resolution: Resolution) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            resolution,
            histogram: None,
        }
    }

    /// Also keep a response time histogram per stream.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not describe a valid histogram.
    pub fn with_histogram(mut self, config: &HistogramConfig) -> Result<Self, histogram::Error> {
        self.histogram = Some(config.build()?);
        Ok(self)
    }

    /// The timestamp resolution offers are read in.
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Record one result on `stream`.
    pub fn offer(&self, stream: &Stream, input_ts: u64, output_ts: u64) {
        let mut state = self.state.lock();
        state.stats.offer(stream, input_ts, output_ts, self.resolution);
        if let Some(template) = &self.histogram {
            let rt = state
                .stats
                .get(stream)
                .and_then(crate::OutStreamCounters::last_rt)
                .unwrap_or_default();
            state
                .histograms
                .entry(stream.clone())
                .or_insert_with(|| template.clone())
                .add_item(rt);
        }
    }

    /// Close the current interval of length `bucket`, copy the statistics and
    /// reset the interval, all under one lock. Returns the copy.
    #[must_use]
    pub fn take_interval(&self, bucket: Duration) -> SinkPerfStats {
        Self::close(&mut self.state.lock(), bucket)
    }

    fn close(state: &mut State, bucket: Duration) -> SinkPerfStats {
        state.stats.close_interval(bucket.as_secs_f64());
        let copy = state.stats.clone();
        state.stats.reset();
        copy
    }

    /// Take an interval, see [`Recorder::take_interval`], and derive one
    /// [`PerformanceStats`] per stream, sorted. `timestamp` labels the
    /// snapshots, `elapsed` is the time since the run started.
    #[must_use]
    pub fn snapshot(&self, timestamp: u64, bucket: Duration, elapsed: Duration) -> Vec<PerformanceStats> {
        let (stats, histograms) = {
            let mut state = self.state.lock();
            let copy = Self::close(&mut state, bucket);
            (copy, state.histograms.clone())
        };
        let elapsed = elapsed.as_secs_f64();
        let mut snapshots: Vec<_> = stats
            .streams()
            .map(|(stream, counters)| {
                let mut perf = PerformanceStats::from_counters(timestamp, stream.clone(), counters, elapsed);
                perf.histogram = histograms.get(stream).map(Histogram::histogram);
                perf
            })
            .collect();
        snapshots.sort();
        snapshots
    }

    /// A deep copy of the current statistics, without resetting.
    #[must_use]
    pub fn peek(&self) -> SinkPerfStats {
        self.state.lock().stats.clone()
    }

    /// Results recorded on every stream since creation.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.state.lock().stats.total_count()
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::{HistogramConfig, Recorder};
    use crate::{counters::Resolution, stream::Stream};

    #[test]
    fn concurrent_offers_are_all_counted() {
        let recorder = Recorder::new(Resolution::Millis);
        let snapshots = Arc::new(parking_lot::Mutex::new(0u64));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let recorder = recorder.clone();
                thread::spawn(move || {
                    let stream = Stream::output(format!("s{}", w % 2));
                    for i in 0..1_000 {
                        recorder.offer(&stream, i, i + 3);
                    }
                })
            })
            .collect();
        let reader = {
            let recorder = recorder.clone();
            let snapshots = Arc::clone(&snapshots);
            thread::spawn(move || {
                for _ in 0..50 {
                    let interval = recorder.take_interval(Duration::from_millis(10));
                    let seen: u64 = interval.streams().map(|(_, c)| c.last_count()).sum();
                    *snapshots.lock() += seen;
                }
            })
        };
        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        let rest: u64 = recorder
            .take_interval(Duration::from_millis(10))
            .streams()
            .map(|(_, c)| c.last_count())
            .sum();
        // Every offer lands in exactly one interval.
        assert_eq!(*snapshots.lock() + rest, 4_000);
        assert_eq!(recorder.total_count(), 4_000);
    }

    #[test]
    fn snapshot_is_sorted_and_resets_interval() {
        let recorder = Recorder::new(Resolution::Millis);
        recorder.offer(&Stream::output("b"), 0, 10);
        recorder.offer(&Stream::output("a"), 0, 20);
        recorder.offer(&Stream::output("a"), 0, 30);

        let first = recorder.snapshot(1_000, Duration::from_secs(1), Duration::from_secs(1));
        let names: Vec<_> = first.iter().map(|s| s.stream.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(first[0].interval_count, 2);
        assert!((first[0].last_throughput - 2.0).abs() < f64::EPSILON);

        let second = recorder.snapshot(2_000, Duration::from_secs(1), Duration::from_secs(2));
        assert_eq!(second[0].interval_count, 0);
        assert_eq!(second[0].total_count, 2);
        assert!((second[0].min_throughput - 0.0).abs() < f64::EPSILON);
        assert!((second[0].max_throughput - 2.0).abs() < f64::EPSILON);
        assert!((second[0].avg_throughput - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn histograms_kept_per_stream() {
        let recorder = Recorder::new(Resolution::Nanos)
            .with_histogram(&HistogramConfig {
                min: 0.0,
                max: 10.0,
                buckets: 12,
                cumulative: false,
            })
            .unwrap();
        recorder.offer(&Stream::output("a"), 0, 5_000_000);
        recorder.offer(&Stream::output("a"), 0, 50_000_000);
        let snapshot = recorder.snapshot(0, Duration::from_secs(1), Duration::from_secs(1));
        let histogram = snapshot[0].histogram.as_ref().unwrap();
        assert_eq!(histogram.len(), 12);
        let total: f64 = histogram.iter().map(|(_, f)| f).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((histogram[11].1 - 0.5).abs() < f64::EPSILON);
    }
}

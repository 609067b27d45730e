//! Statistics for every stream observed by one sink.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    counters::{OutStreamCounters, Resolution},
    stream::Stream,
};

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
/// Per-stream counters plus the window of output timestamps seen since the
/// last reset.
///
/// `Clone` is a deep copy: a clone never observes later offers to the
/// original.
pub struct SinkPerfStats {
    start: Option<u64>,
    end: Option<u64>,
    #[serde(serialize_with = "serialize_streams")]
    streams: FxHashMap<Stream, OutStreamCounters>,
}

fn serialize_streams<S>(
    streams: &FxHashMap<Stream, OutStreamCounters>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    // JSON object keys must be strings.
    serializer.collect_map(streams.iter().map(|(k, v)| (k.to_string(), v)))
}

impl SinkPerfStats {
    /// Record one result on `stream`, creating its counters on first use.
    pub fn offer(&mut self, stream: &Stream, input_ts: u64, output_ts: u64, resolution: Resolution) {
        match self.streams.get_mut(stream) {
            Some(counters) => counters.offer(input_ts, output_ts, resolution),
            None => {
                let mut counters = OutStreamCounters::default();
                counters.offer(input_ts, output_ts, resolution);
                self.streams.insert(stream.clone(), counters);
            }
        }
        self.start = Some(self.start.map_or(output_ts, |s| s.min(output_ts)));
        self.end = Some(self.end.map_or(output_ts, |e| e.max(output_ts)));
    }

    /// Close a reporting interval of `seconds` on every stream, see
    /// [`OutStreamCounters::close_interval`].
    pub fn close_interval(&mut self, seconds: f64) {
        for counters in self.streams.values_mut() {
            counters.close_interval(seconds);
        }
    }

    /// Zero every interval count and the window. Cumulative totals are kept.
    pub fn reset(&mut self) {
        for counters in self.streams.values_mut() {
            counters.reset();
        }
        self.start = None;
        self.end = None;
    }

    /// The `[start, end]` output timestamp window since the last reset.
    #[must_use]
    pub fn window(&self) -> Option<(u64, u64)> {
        self.start.zip(self.end)
    }

    /// Counters of `stream`, if it has been offered to.
    #[must_use]
    pub fn get(&self, stream: &Stream) -> Option<&OutStreamCounters> {
        self.streams.get(stream)
    }

    /// Every stream and its counters, in no particular order.
    pub fn streams(&self) -> impl Iterator<Item = (&Stream, &OutStreamCounters)> {
        self.streams.iter()
    }

    /// Sum of cumulative counts over every stream.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.streams.values().map(OutStreamCounters::total_count).sum()
    }
}

#[cfg(test)]
mod test {
    use proptest::{collection, prelude::*};

    use super::SinkPerfStats;
    use crate::{counters::Resolution, stream::Stream};

    #[test]
    fn offers_route_by_stream() {
        let mut stats = SinkPerfStats::default();
        stats.offer(&Stream::output("a"), 0, 5, Resolution::Millis);
        stats.offer(&Stream::output("a"), 10, 12, Resolution::Millis);
        stats.offer(&Stream::output("b"), 0, 3, Resolution::Millis);
        stats.offer(&Stream::input("a"), 0, 1, Resolution::Millis);

        assert_eq!(stats.get(&Stream::output("a")).map(|c| c.total_count()), Some(2));
        assert_eq!(stats.get(&Stream::output("b")).map(|c| c.total_count()), Some(1));
        assert_eq!(stats.get(&Stream::input("a")).map(|c| c.total_count()), Some(1));
        assert_eq!(stats.window(), Some((1, 12)));
        assert_eq!(stats.total_count(), 4);
    }

    #[test]
    fn reset_clears_window_keeps_totals() {
        let mut stats = SinkPerfStats::default();
        stats.offer(&Stream::output("a"), 0, 5, Resolution::Millis);
        stats.reset();
        assert_eq!(stats.window(), None);
        let counters = stats.get(&Stream::output("a")).unwrap();
        assert_eq!(counters.total_count(), 1);
        assert_eq!(counters.last_count(), 0);
    }

    #[test]
    fn serializes_with_string_keys() {
        let mut stats = SinkPerfStats::default();
        stats.offer(&Stream::output("a"), 0, 5, Resolution::Millis);
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["streams"]["out:a"].is_object());
    }

    proptest! {
        // A clone is unaffected by offers to the original made after cloning.
        #[test]
        fn clone_is_independent(before in collection::vec(0u64..100, 1..50), after in collection::vec(0u64..100, 1..50)) {
            let stream = Stream::output("s");
            let mut stats = SinkPerfStats::default();
            for rt in &before {
                stats.offer(&stream, 0, *rt, Resolution::Millis);
            }
            let snapshot = stats.clone();
            let expected = snapshot.get(&stream).cloned();
            for rt in &after {
                stats.offer(&stream, 0, *rt, Resolution::Millis);
                stats.offer(&Stream::output("t"), 0, *rt, Resolution::Millis);
            }
            stats.reset();
            prop_assert_eq!(snapshot.get(&stream).cloned(), expected);
            prop_assert_eq!(snapshot.get(&stream).map(|c| c.total_count()), Some(before.len() as u64));
            prop_assert!(snapshot.get(&Stream::output("t")).is_none());
        }
    }
}

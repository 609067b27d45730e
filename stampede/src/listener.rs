//! The response listener.
//!
//! Results coming back from the system under test are reported here and
//! recorded against their stream. The response time of a result runs from the
//! send timestamp the worker stamped on its event to an output timestamp,
//! which is either attached by the adapter that emitted the result or taken
//! by the listener at observation.
//!
//! ## Metrics
//!
//! `events_received`: Results recorded

use metrics::counter;
use serde::{Deserialize, Serialize};
use stampede_payload::Event;
use stampede_stats::{Recorder, Stream};

use crate::common::{self, MetricsBuilder};

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
/// Source of the output timestamp of a result.
pub enum TimestampMode {
    /// The adapter attaches the output timestamp when it emits the result.
    Adapter,
    /// The listener takes the output timestamp when it observes the result.
    #[default]
    EndToEnd,
}

#[derive(Debug, Clone)]
/// Records results into a shared [`Recorder`].
pub struct Listener {
    recorder: Recorder,
    mode: TimestampMode,
    labels: Vec<(String, String)>,
}

impl Listener {
    /// Create a new [`Listener`].
    #[must_use]
    pub fn new(recorder: Recorder, mode: TimestampMode) -> Self {
        Self {
            recorder,
            mode,
            labels: MetricsBuilder::new("listener", "listener").build(),
        }
    }

    /// Record one result. `event.timestamp` is the send timestamp and
    /// `emitted` the output timestamp the adapter attached, if any. In
    /// [`TimestampMode::EndToEnd`], or when the adapter attached nothing, the
    /// current time is used instead.
    pub fn on_output(&self, stream: &Stream, event: &Event, emitted: Option<u64>) {
        let output_ts = match (self.mode, emitted) {
            (TimestampMode::Adapter, Some(ts)) => ts,
            _ => common::now(self.recorder.resolution()),
        };
        self.recorder.offer(stream, event.timestamp, output_ts);
        counter!("events_received", &self.labels).increment(1);
    }

    /// The recorder results are written to.
    #[must_use]
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }
}

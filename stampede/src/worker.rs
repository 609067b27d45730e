//! The worker
//!
//! A worker is one of the parallel execution units of a phase. Each runs an
//! independent loop: wait for its next scheduled slot, obtain an event from
//! its synthesizer handle or dataset replay, stamp it with the send time and
//! hand it to the sink. Workers never wait on one another.
//!
//! ## Metrics
//!
//! `events_sent`: Events handed to the sink
//! `events_exhausted`: Workers that ran out of events
//! `send_failure`: Events the sink refused
//! `replay_loops`: Dataset loops completed, replay workers only
//! `schedule_lag_micros`: How late the most recent slot was
//!
//! Run state is checked at the top of every iteration and before every sleep,
//! so a worker observes a pause or stop within one [`QUANTUM`].
//!
//! [`QUANTUM`]: stampede_throttle::QUANTUM

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use metrics::{counter, gauge};
use stampede_payload::{
    dataset::{self, Replay, Scheduled},
    synth,
};
use stampede_stats::Resolution;
use stampede_throttle::{Slot, Throttle};
use tracing::{debug, info, warn};

use crate::{
    common,
    signals::{RunState, Watcher},
    sink::{self, Sink},
};

/// Errors produced by [`Worker`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sink refused an event.
    #[error(transparent)]
    Sink(#[from] sink::Error),
    /// The dataset could not be replayed.
    #[error(transparent)]
    Dataset(#[from] dataset::Error),
}

/// Counts shared by every worker of a run.
#[derive(Debug, Default)]
pub struct Sent {
    total: AtomicU64,
    phase: AtomicU64,
}

impl Sent {
    /// Events sent since the run started.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Events sent since the current phase started.
    #[must_use]
    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::Relaxed)
    }

    /// Start counting a new run.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.phase.store(0, Ordering::Relaxed);
    }

    /// Start counting a new phase.
    pub fn begin_phase(&self) {
        self.phase.store(0, Ordering::Relaxed);
    }

    fn record(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.phase.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
/// Where a worker's events come from.
pub enum Source {
    /// Synthesized events paced by an open-loop throttle.
    Synthetic {
        /// This worker's view of the phase synthesizer.
        handle: synth::Handle,
        /// Open-loop pacing.
        throttle: Throttle,
    },
    /// Replayed records, each due at its scheduled offset.
    Replay {
        /// This worker's share of the dataset.
        replay: Replay,
        /// Replay pacing.
        throttle: Throttle,
    },
}

#[derive(Debug)]
/// One parallel execution unit of a phase.
pub struct Worker {
    source: Source,
    sink: Arc<dyn Sink>,
    watcher: Watcher,
    resolution: Resolution,
    sent: Arc<Sent>,
    labels: Vec<(String, String)>,
}

impl Worker {
    /// Create a new [`Worker`].
    #[must_use]
    pub fn new(
        source: Source,
        sink: Arc<dyn Sink>,
        watcher: Watcher,
        resolution: Resolution,
        sent: Arc<Sent>,
        labels: Vec<(String, String)>,
    ) -> Self {
        Self {
            source,
            sink,
            watcher,
            resolution,
            sent,
            labels,
        }
    }

    /// Run until the source is exhausted or the run is stopped. Returns the
    /// number of events this worker sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink refuses an event or the dataset cannot be
    /// read. Exhaustion and stop are not errors.
    pub async fn spin(mut self) -> Result<u64, Error> {
        let mut sent = 0;
        let mut pending: Option<Scheduled> = None;
        loop {
            match self.watcher.state() {
                RunState::Stopped => {
                    debug!(sent, "worker stopped");
                    return Ok(sent);
                }
                RunState::Paused => {
                    if self.watcher.unpaused().await == RunState::Running {
                        let skipped = match &mut self.source {
                            Source::Synthetic { throttle, .. } | Source::Replay { throttle, .. } => {
                                throttle.rebase()
                            }
                        };
                        debug!(skipped_ms = skipped.as_millis(), "worker resumed");
                    }
                    continue;
                }
                RunState::Running => {}
            }

            let watcher = &self.watcher;
            let cancelled = || !watcher.is_running();
            let slot = match &mut self.source {
                Source::Synthetic { throttle, .. } => throttle.wait(cancelled).await,
                Source::Replay { replay, throttle } => {
                    if pending.is_none() {
                        pending = replay.next_record()?;
                        gauge!("replay_loops", &self.labels).set(f64::from(replay.completed_loops()));
                    }
                    let Some(at) = pending.as_ref().map(|s| s.at) else {
                        info!(sent, loops = replay.completed_loops(), "replay complete");
                        counter!("events_exhausted", &self.labels).increment(1);
                        return Ok(sent);
                    };
                    throttle.wait_until(at, cancelled).await
                }
            };
            // A slot can come due after a pause was requested.
            let Slot::Due { lag } = slot else {
                continue;
            };
            if !self.watcher.is_running() {
                continue;
            }

            let (index, mut event) = match &mut self.source {
                Source::Synthetic { handle, .. } => {
                    let Some(issued) = handle.next_event() else {
                        info!(sent, "synthesizer exhausted");
                        counter!("events_exhausted", &self.labels).increment(1);
                        return Ok(sent);
                    };
                    (issued.index, issued.event)
                }
                Source::Replay { .. } => match pending.take() {
                    Some(scheduled) => (scheduled.index, scheduled.event),
                    None => continue,
                },
            };
            gauge!("schedule_lag_micros", &self.labels).set(lag as f64);

            event.timestamp = common::now(self.resolution);
            if let Err(err) = self.sink.send(index, &event).await {
                warn!("Sink refused event {index}: {err}");
                counter!("send_failure", &self.labels).increment(1);
                return Err(err.into());
            }
            sent += 1;
            self.sent.record();
            counter!("events_sent", &self.labels).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroU32,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use stampede_payload::{Attribute, Datatype, Event, EventType, Mix, Synthesizer};
    use stampede_stats::Resolution;
    use stampede_throttle::{QUANTUM, Throttle};
    use tokio::time::Instant;

    use super::{Error, Sent, Source, Worker};
    use crate::{
        signals::{RunState, Watcher, switch},
        sink::{self, Sink},
    };

    #[derive(Debug, Default)]
    struct Capture {
        indices: Mutex<Vec<u64>>,
        fail_at: Option<u64>,
        count: AtomicU64,
    }

    #[async_trait]
    impl Sink for Capture {
        async fn send(&self, index: u64, event: &Event) -> Result<(), sink::Error> {
            assert!(event.timestamp > 0);
            if Some(self.count.fetch_add(1, Ordering::Relaxed)) == self.fail_at {
                return Err(sink::Error::Closed);
            }
            self.indices.lock().push(index);
            Ok(())
        }
    }

    fn synthesizer(total: u64) -> Arc<Synthesizer> {
        let kind = Arc::new(EventType::new("A", vec![Attribute::new("x", Datatype::Long)]).unwrap());
        Arc::new(Synthesizer::new(Mix::deterministic(vec![kind]).unwrap(), total, 1))
    }

    fn worker(
        synth: &Arc<Synthesizer>,
        eps: f64,
        sink: Arc<Capture>,
        watcher: Watcher,
        sent: Arc<Sent>,
    ) -> Worker {
        let throttle = Throttle::new_with_config(
            stampede_throttle::Config::Stable {
                events_per_second: eps,
            },
            0,
            NonZeroU32::MIN,
        )
        .unwrap();
        Worker::new(
            Source::Synthetic {
                handle: synth.handle(0).unwrap(),
                throttle,
            },
            sink,
            watcher,
            Resolution::Millis,
            sent,
            Vec::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn runs_to_exhaustion_at_rate() {
        let synth = synthesizer(50);
        let sink = Arc::new(Capture::default());
        let sent = Arc::new(Sent::default());
        let (_switch, watcher) = switch(RunState::Running);
        let start = Instant::now();
        let count = worker(&synth, 100.0, Arc::clone(&sink), watcher, Arc::clone(&sent))
            .spin()
            .await
            .unwrap();
        assert_eq!(count, 50);
        assert_eq!(sent.total(), 50);
        assert_eq!(*sink.indices.lock(), (0..50).collect::<Vec<_>>());
        // 50 events at 100/s, the first immediately.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(510), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_observed_within_quantum() {
        let synth = synthesizer(u64::MAX);
        let sink = Arc::new(Capture::default());
        let (switch, watcher) = switch(RunState::Running);
        let task = worker(&synth, 0.5, Arc::clone(&sink), watcher, Arc::new(Sent::default()));
        let task = tokio::spawn(task.spin());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped_at = Instant::now();
        switch.set(RunState::Stopped);
        let count = task.await.unwrap().unwrap();
        assert!(stopped_at.elapsed() <= QUANTUM);
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_emits_nothing_and_resume_does_not_burst() {
        let synth = synthesizer(u64::MAX);
        let sink = Arc::new(Capture::default());
        let (switch, watcher) = switch(RunState::Running);
        let task = worker(&synth, 10.0, Arc::clone(&sink), watcher, Arc::new(Sent::default()));
        let task = tokio::spawn(task.spin());

        tokio::time::sleep(Duration::from_millis(950)).await;
        switch.set(RunState::Paused);
        let before = sink.indices.lock().len();
        assert_eq!(before, 10);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.indices.lock().len(), before);

        switch.set(RunState::Running);
        tokio::time::sleep(Duration::from_millis(950)).await;
        let after = sink.indices.lock().len();
        // One second's worth, not the ten paused seconds caught up.
        assert!((before + 9..=before + 11).contains(&after), "{before} {after}");

        switch.set(RunState::Stopped);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_is_raised() {
        let synth = synthesizer(10);
        let sink = Arc::new(Capture {
            fail_at: Some(3),
            ..Capture::default()
        });
        let (_switch, watcher) = switch(RunState::Running);
        let result = worker(&synth, 1_000.0, Arc::clone(&sink), watcher, Arc::new(Sent::default()))
            .spin()
            .await;
        assert!(matches!(result, Err(Error::Sink(sink::Error::Closed))));
        assert_eq!(sink.indices.lock().len(), 3);
    }
}

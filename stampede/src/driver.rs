//! The stampede driver
//!
//! The driver owns the workers of a loaded workload and moves the run through
//! its lifecycle:
//!
//! ```text
//! NOT_LOADED -> LOADED -> RUNNING <-> PAUSED -> STOPPED
//! ```
//!
//! Phases run in configuration order. Every phase is run by `workers`
//! parallel [`Worker`]s and the next phase begins once all of them have
//! finished. The driver never sits on the emission path; it only flips the run
//! state and reads shared counters.

use std::{
    fmt,
    fs::File,
    io::BufWriter,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stampede_payload::{
    Schema, Synthesizer,
    dataset::{self, Replay},
    synth::{self, derive_seed},
};
use stampede_stats::{
    Recorder, Reporter, histogram,
    reporter::{self, Format},
};
use stampede_throttle::Throttle;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::{
    common::MetricsBuilder,
    config::{self, Config, Phase},
    listener::Listener,
    signals::{self, RunState, Switch},
    sink::{self, Sink},
    worker::{self, Sent, Source, Worker},
};

/// Errors produced by [`Driver`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A control operation was invoked in the wrong lifecycle state.
    #[error("Cannot {op} while {status}")]
    InvalidState {
        /// The refused operation.
        op: &'static str,
        /// The status at the time.
        status: Status,
    },
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The sink failed.
    #[error(transparent)]
    Sink(#[from] sink::Error),
    /// A worker failed.
    #[error(transparent)]
    Worker(#[from] worker::Error),
    /// A dataset could not be opened for replay.
    #[error(transparent)]
    Dataset(#[from] dataset::Error),
    /// A synthesizer handle could not be built.
    #[error(transparent)]
    Synth(#[from] synth::Error),
    /// A throttle could not be built.
    #[error(transparent)]
    Throttle(#[from] stampede_throttle::Error),
    /// The response time histogram could not be built.
    #[error(transparent)]
    Histogram(#[from] histogram::Error),
    /// The statistics reporter failed.
    #[error(transparent)]
    Reporter(#[from] reporter::Error),
    /// A worker or reporter task panicked or was aborted.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Category of this error, as reported over the control surface.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidState { .. } => "invalid_state",
            Error::Config(_) | Error::Throttle(_) | Error::Histogram(_) | Error::Synth(_) => {
                "invalid_parameter"
            }
            Error::Sink(sink::Error::Protocol(_))
            | Error::Worker(worker::Error::Sink(sink::Error::Protocol(_))) => "protocol_failure",
            Error::Sink(_)
            | Error::Worker(_)
            | Error::Dataset(_)
            | Error::Reporter(_) => "io_failure",
            Error::Join(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Lifecycle status of a [`Driver`].
pub enum Status {
    /// No workload loaded.
    NotLoaded,
    /// A workload is loaded and ready to start.
    Loaded,
    /// Workers are emitting.
    Running,
    /// Workers hold, emitting nothing.
    Paused,
    /// The run has ended, by completion, stop or failure.
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NotLoaded => "NOT_LOADED",
            Status::Loaded => "LOADED",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Aggregate progress of the current run.
pub struct Progress {
    /// Lifecycle status.
    pub status: Status,
    /// Zero-based index of the phase running, or last run.
    pub phase: usize,
    /// Number of phases in the workload, zero when nothing is loaded.
    pub phases: usize,
    /// Events sent by every worker since the run started.
    pub total_events_sent: u64,
    /// Events sent by every worker since the current phase started.
    pub phase_events_sent: u64,
    /// Fraction of a synthetic phase's budget issued, absent for replay.
    pub phase_progress: Option<f64>,
}

#[derive(Debug)]
struct Plan {
    config: Config,
    schema: Arc<Schema>,
}

#[derive(Debug, Default)]
struct Shared {
    sent: Arc<Sent>,
    phase: AtomicUsize,
    synth: Mutex<Option<Arc<Synthesizer>>>,
}

#[derive(Debug)]
struct Run {
    switch: Switch,
    recorder: Recorder,
    task: Option<JoinHandle<Result<u64, Error>>>,
}

#[derive(Debug, Default)]
struct Inner {
    plan: Option<Arc<Plan>>,
    run: Option<Run>,
}

impl Inner {
    fn status(&self) -> Status {
        match (&self.plan, &self.run) {
            (None, _) => Status::NotLoaded,
            (Some(_), None) => Status::Loaded,
            (Some(_), Some(run)) => match run.switch.state() {
                RunState::Running => Status::Running,
                RunState::Paused => Status::Paused,
                RunState::Stopped => Status::Stopped,
            },
        }
    }

    fn refuse(&self, op: &'static str) -> Error {
        let status = self.status();
        warn!(op, %status, "control operation refused");
        Error::InvalidState { op, status }
    }
}

/// Orchestrates the workers of one workload.
#[derive(Debug, Default)]
pub struct Driver {
    inner: Mutex<Inner>,
    shared: Arc<Shared>,
}

impl Driver {
    /// Create a new, unloaded [`Driver`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `config`, replacing any workload loaded or run before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while running or paused and
    /// [`Error::Config`] if `config` is invalid.
    pub fn load(&self, config: Config) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if matches!(inner.status(), Status::Running | Status::Paused) {
            return Err(inner.refuse("load"));
        }
        config.validate()?;
        let schema = Arc::new(config.schema()?);
        info!(
            phases = config.phases.len(),
            workers = config.workers.get(),
            types = schema.types().len(),
            "workload loaded"
        );
        inner.plan = Some(Arc::new(Plan { config, schema }));
        inner.run = None;
        Ok(())
    }

    /// Discard the loaded workload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while running or paused.
    pub fn unload(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if matches!(inner.status(), Status::Running | Status::Paused) {
            return Err(inner.refuse("unload"));
        }
        inner.plan = None;
        inner.run = None;
        info!("workload unloaded");
        Ok(())
    }

    /// Start the loaded workload. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless loaded. Returns an error if the
    /// sink, the statistics report file or the response time histogram
    /// cannot be set up.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.status() != Status::Loaded {
            return Err(inner.refuse("start"));
        }
        let Some(plan) = inner.plan.clone() else {
            return Err(inner.refuse("start"));
        };
        let config = &plan.config;

        let mut recorder = Recorder::new(config.resolution);
        if let Some(histogram) = &config.stats.histogram {
            recorder = recorder.with_histogram(histogram)?;
        }
        let listener = Listener::new(recorder.clone(), config.stats.timestamp_mode);
        let sink = sink::build(&config.sink, &plan.schema, config.resolution, &listener)?;
        let (switch, watcher) = signals::switch(RunState::Running);

        let reporter = match &config.stats.path {
            Some(path) => {
                let format: Format<BufWriter<File>> = Format::create(path)?;
                let reporter = Reporter::new(recorder.clone(), config.stats.bucket(), format)?;
                info!(path = %path.display(), "writing performance statistics");
                Some(tokio::spawn(reporter.run(watcher.stopped())))
            }
            None => None,
        };

        self.shared.sent.reset();
        self.shared.phase.store(0, Ordering::Relaxed);
        *self.shared.synth.lock() = None;

        let task = tokio::spawn(execute(
            Arc::clone(&plan),
            Arc::clone(&self.shared),
            switch.clone(),
            sink,
            reporter,
        ));
        inner.run = Some(Run {
            switch,
            recorder,
            task: Some(task),
        });
        info!("run started");
        Ok(())
    }

    /// Hold every worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless running.
    pub fn pause(&self) -> Result<(), Error> {
        self.transition("pause", Status::Running, RunState::Paused)
    }

    /// Release held workers. Their schedules restart from now, so paused time
    /// is not caught up as a burst.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless paused.
    pub fn resume(&self) -> Result<(), Error> {
        self.transition("resume", Status::Paused, RunState::Running)
    }

    fn transition(&self, op: &'static str, from: Status, to: RunState) -> Result<(), Error> {
        let inner = self.inner.lock();
        match &inner.run {
            Some(run) if inner.status() == from => {
                run.switch.set(to);
                info!(op, "run state changed");
                Ok(())
            }
            _ => Err(inner.refuse(op)),
        }
    }

    /// Stop the run. Workers exit within one scheduling quantum; use
    /// [`Driver::join`] to wait for them. Stopping a stopped run does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no run was started.
    pub fn stop(&self) -> Result<(), Error> {
        let inner = self.inner.lock();
        let Some(run) = &inner.run else {
            return Err(inner.refuse("stop"));
        };
        if run.switch.set(RunState::Stopped) != RunState::Stopped {
            info!("run stopped");
        }
        if let Some(synth) = self.shared.synth.lock().as_ref() {
            synth.stop();
        }
        Ok(())
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.lock().status()
    }

    /// Aggregate progress of the current run.
    #[must_use]
    pub fn progress(&self) -> Progress {
        let inner = self.inner.lock();
        let status = inner.status();
        let phases = inner.plan.as_ref().map_or(0, |plan| plan.config.phases.len());
        Progress {
            status,
            phase: self.shared.phase.load(Ordering::Relaxed),
            phases,
            total_events_sent: self.shared.sent.total(),
            phase_events_sent: self.shared.sent.phase(),
            phase_progress: self.shared.synth.lock().as_ref().map(|synth| synth.progress()),
        }
    }

    /// Statistics recorder of the current run, if started.
    #[must_use]
    pub fn recorder(&self) -> Option<Recorder> {
        self.inner.lock().run.as_ref().map(|run| run.recorder.clone())
    }

    /// Wait for the run to end and return the number of events sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no run was started or it was already
    /// joined, otherwise the first error the run met.
    pub async fn join(&self) -> Result<u64, Error> {
        let task = {
            let mut inner = self.inner.lock();
            match inner.run.as_mut().and_then(|run| run.task.take()) {
                Some(task) => task,
                None => return Err(inner.refuse("join")),
            }
        };
        task.await?
    }
}

async fn execute(
    plan: Arc<Plan>,
    shared: Arc<Shared>,
    switch: Switch,
    sink: Arc<dyn Sink>,
    reporter: Option<JoinHandle<Result<BufWriter<File>, reporter::Error>>>,
) -> Result<u64, Error> {
    let mut failure: Option<Error> = None;
    for (idx, phase) in plan.config.phases.iter().enumerate() {
        if switch.state() == RunState::Stopped {
            break;
        }
        shared.phase.store(idx, Ordering::Relaxed);
        shared.sent.begin_phase();
        match run_phase(&plan, idx, phase, &shared, &switch, &sink).await {
            Ok(sent) => info!(phase = idx, kind = phase.kind(), sent, "phase complete"),
            Err(err) => {
                error!("Phase {idx} failed: {err}");
                failure = Some(err);
                break;
            }
        }
    }
    switch.set(RunState::Stopped);

    // Partial output is always closed, even on failure.
    if let Err(err) = sink.close().await {
        error!("Failed to close sink: {err}");
        failure.get_or_insert(err.into());
    }
    if let Some(reporter) = reporter {
        let report = match reporter.await {
            Ok(report) => report.map(drop).map_err(Error::from),
            Err(err) => Err(Error::from(err)),
        };
        if let Err(err) = report {
            error!("Statistics reporter failed: {err}");
            failure.get_or_insert(err);
        }
    }
    let sent = shared.sent.total();
    info!(sent, "run complete");
    match failure {
        Some(err) => Err(err),
        None => Ok(sent),
    }
}

async fn run_phase(
    plan: &Plan,
    idx: usize,
    phase: &Phase,
    shared: &Arc<Shared>,
    switch: &Switch,
    sink: &Arc<dyn Sink>,
) -> Result<u64, Error> {
    let config = &plan.config;
    let workers: NonZeroU32 = config.workers;
    let phase_seed = derive_seed(config.seed, &[idx as u64]);
    info!(phase = idx, kind = phase.kind(), workers = workers.get(), "phase starting");

    let mut sources = Vec::with_capacity(workers.get() as usize);
    match phase {
        Phase::Synthetic(synthetic) => {
            let mix = synthetic.mix(&plan.schema, config.seed)?;
            let synth = Arc::new(Synthesizer::new(mix, synthetic.total_events, phase_seed));
            for worker in 0..workers.get() {
                sources.push(Source::Synthetic {
                    handle: synth.handle(worker)?,
                    throttle: Throttle::new_with_config(
                        synthetic.throttle,
                        derive_seed(phase_seed, &[u64::from(worker)]),
                        workers,
                    )?,
                });
            }
            *shared.synth.lock() = Some(synth);
        }
        Phase::File(file) => {
            let (loops, pacing) = (file.loops()?, file.pacing()?);
            for worker in 0..workers.get() {
                let replay = Replay::open(
                    file.path.clone(),
                    file.format(),
                    Arc::clone(&plan.schema),
                    loops,
                    pacing,
                    worker,
                    workers,
                )?;
                sources.push(Source::Replay {
                    replay,
                    throttle: Throttle::replay(),
                });
            }
            *shared.synth.lock() = None;
        }
    }

    let mut set = JoinSet::new();
    for (worker, source) in sources.into_iter().enumerate() {
        let labels = MetricsBuilder::new("worker", phase.kind())
            .with_label("worker", worker)
            .with_label("phase", idx)
            .build();
        let worker = Worker::new(
            source,
            Arc::clone(sink),
            switch.watcher(),
            config.resolution,
            Arc::clone(&shared.sent),
            labels,
        );
        set.spawn(worker.spin());
    }

    let mut sent = 0;
    let mut failure = None;
    while let Some(joined) = set.join_next().await {
        let err = match joined {
            Ok(Ok(count)) => {
                sent += count;
                continue;
            }
            Ok(Err(err)) => Error::from(err),
            Err(err) => Error::from(err),
        };
        error!("Worker failed: {err}");
        if failure.is_none() {
            // One failed worker ends the run for the rest.
            switch.set(RunState::Stopped);
            if let Some(synth) = shared.synth.lock().as_ref() {
                synth.stop();
            }
            failure = Some(err);
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(sent),
    }
}

//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    env, fs,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use stampede_payload::{
    EventType, Mix, Schema,
    converter,
    dataset::{self, Pacing, TimestampUnit},
    mix::{self, Weight},
};
use stampede_stats::{Resolution, recorder::HistogramConfig};
use tracing::debug;

use crate::listener::TimestampMode;

/// Environment variable that, when set, holds the configuration itself.
pub const CONFIG_ENV: &str = "STAMPEDE_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// A parameter is out of its legal domain.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Where in the configuration the parameter is.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(name: impl Into<String>, reason: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.into(),
        reason: reason.to_string(),
    }
}

fn default_workers() -> NonZeroU32 {
    NonZeroU32::MIN
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seed from which every generator in the run is derived.
    #[serde(default)]
    pub seed: u64,
    /// Parallel workers per phase.
    #[serde(default = "default_workers")]
    pub workers: NonZeroU32,
    /// Resolution of event timestamps.
    #[serde(default)]
    pub resolution: Resolution,
    /// Event types known to the run.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub schema: Vec<EventType>,
    /// Workload phases, run in order.
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub phases: Vec<Phase>,
    /// Where events go.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub sink: Sink,
    /// Performance statistics.
    #[serde(default)]
    pub stats: Stats,
    /// The method by which to express telemetry
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub telemetry: Option<Telemetry>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// One workload phase.
pub enum Phase {
    /// Events synthesized from the schema.
    Synthetic(Synthetic),
    /// Events replayed from a dataset file.
    File(File),
}

impl Phase {
    /// Short name of the phase kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Phase::Synthetic(_) => "synthetic",
            Phase::File(_) => "file",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_throttle() -> stampede_throttle::Config {
    stampede_throttle::Config::AllOut
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// A synthetic phase.
pub struct Synthetic {
    /// Events to generate over all workers.
    pub total_events: u64,
    /// Event types and their weights. Order is the cycle order of a
    /// deterministic mix.
    pub mix: Vec<Weight>,
    /// Cycle through `mix` in order rather than sampling by weight.
    #[serde(default = "default_true")]
    pub deterministic: bool,
    /// Seed of the stochastic mix, the run seed if absent.
    pub mix_seed: Option<u64>,
    /// Arrival process.
    #[serde(default = "default_throttle")]
    pub throttle: stampede_throttle::Config,
}

impl Synthetic {
    /// Build this phase's [`Mix`] over `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the mix names an unknown type or
    /// its weights are invalid.
    pub fn mix(&self, schema: &Schema, seed: u64) -> Result<Mix, Error> {
        let entries = self
            .mix
            .iter()
            .map(|w| {
                schema
                    .get(&w.event_type)
                    .map(|kind| (Arc::clone(kind), w.weight))
                    .ok_or_else(|| invalid("mix", format!("unknown event type {:?}", w.event_type)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Mix::new(entries, self.deterministic, self.mix_seed.unwrap_or(seed))
            .map_err(|err: mix::Error| invalid("mix", err))
    }
}

fn default_loops() -> u32 {
    1
}

fn default_separator() -> char {
    ','
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// An external-file phase.
pub struct File {
    /// Dataset to replay.
    pub path: PathBuf,
    /// Times to replay the dataset.
    #[serde(default = "default_loops")]
    pub loops: u32,
    /// Records carry a timestamp field.
    #[serde(default)]
    pub has_timestamps: bool,
    /// Records begin with a type marker.
    #[serde(default)]
    pub has_types: bool,
    /// Field separator.
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Unit of the timestamp field.
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
    /// Replay rate over all workers when timestamps are absent or ignored.
    pub events_per_second: Option<f64>,
    /// Pace by recorded timestamps when present.
    #[serde(default = "default_true")]
    pub use_timestamps: bool,
}

impl File {
    /// The record layout of the dataset.
    #[must_use]
    pub fn format(&self) -> dataset::Format {
        dataset::Format {
            separator: self.separator,
            has_types: self.has_types,
            has_timestamps: self.has_timestamps,
            timestamp_unit: self.timestamp_unit.clone(),
        }
    }

    /// How records are placed in time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if a rate is needed but missing or
    /// not strictly positive.
    pub fn pacing(&self) -> Result<Pacing, Error> {
        if self.has_timestamps && self.use_timestamps {
            return Ok(Pacing::Recorded);
        }
        match self.events_per_second {
            Some(rate) if rate.is_finite() && rate > 0.0 => Ok(Pacing::Rate(rate)),
            Some(rate) => Err(invalid("events_per_second", format!("{rate} must be finite and strictly positive"))),
            None => Err(invalid("events_per_second", "required when timestamps are absent or ignored")),
        }
    }

    /// Replay count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if zero.
    pub fn loops(&self) -> Result<NonZeroU32, Error> {
        NonZeroU32::new(self.loops).ok_or_else(|| invalid("loops", "must be at least 1"))
    }
}

fn default_partitions() -> NonZeroUsize {
    NonZeroUsize::MIN
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Output sink.
pub enum Sink {
    /// Encode every event and drop it.
    #[default]
    Blackhole,
    /// Write events round-robin into partition files.
    File {
        /// Path template, `%NNN%` is replaced by the partition number.
        path_template: String,
        /// Number of partition files.
        #[serde(default = "default_partitions")]
        partitions: NonZeroUsize,
        /// Record layout.
        #[serde(default = "sink_format")]
        format: dataset::Format,
    },
    /// Hand every event straight to the response listener through a
    /// converter, a system under test with no latency of its own.
    Loopback {
        /// Wire encoding used on the way through.
        #[serde(default)]
        converter: converter::Kind,
    },
}

fn sink_format() -> dataset::Format {
    dataset::Format {
        has_types: true,
        has_timestamps: true,
        ..dataset::Format::default()
    }
}

fn default_bucket_millis() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Statistics configuration.
pub struct Stats {
    /// Length of a reporting bucket.
    #[serde(default = "default_bucket_millis")]
    pub bucket_millis: u64,
    /// JSON lines report file, no report file if absent.
    pub path: Option<PathBuf>,
    /// Where response time output timestamps come from.
    #[serde(default)]
    pub timestamp_mode: TimestampMode,
    /// Per-stream response time histograms.
    pub histogram: Option<HistogramConfig>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            bucket_millis: default_bucket_millis(),
            path: None,
            timestamp_mode: TimestampMode::default(),
            histogram: None,
        }
    }
}

impl Stats {
    /// The reporting bucket.
    #[must_use]
    pub fn bucket(&self) -> Duration {
        Duration::from_millis(self.bucket_millis)
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Defines the manner of stampede's own telemetry.
pub enum Telemetry {
    /// In prometheus mode stampede will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Parse and validate `contents`.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not a valid configuration.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration from [`CONFIG_ENV`] if set, otherwise from
    /// `path`, and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not hold a valid
    /// configuration.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if let Ok(contents) = env::var(CONFIG_ENV) {
            debug!("Using config from env var '{CONFIG_ENV}'");
            return Self::parse(&contents);
        }
        debug!("Attempting to open configuration file at: {}", path.display());
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::parse(&contents)
    }

    /// The schema declared by this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if a type is invalid or two types
    /// share a name.
    pub fn schema(&self) -> Result<Schema, Error> {
        Schema::new(self.schema.clone()).map_err(|err| invalid("schema", err))
    }

    /// Check every parameter of the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        let schema = self.schema()?;
        if self.phases.is_empty() {
            return Err(invalid("phases", "at least one phase is required"));
        }
        for (idx, phase) in self.phases.iter().enumerate() {
            match phase {
                Phase::Synthetic(synthetic) => {
                    if synthetic.total_events == 0 {
                        return Err(invalid(format!("phases[{idx}].total_events"), "must be at least 1"));
                    }
                    synthetic.mix(&schema, self.seed).map_err(|err| nest(idx, err))?;
                    synthetic
                        .throttle
                        .validate()
                        .map_err(|err| invalid(format!("phases[{idx}].throttle"), err))?;
                }
                Phase::File(file) => {
                    file.loops().map_err(|err| nest(idx, err))?;
                    file.pacing().map_err(|err| nest(idx, err))?;
                    file.format()
                        .validate()
                        .map_err(|err| invalid(format!("phases[{idx}].separator"), err))?;
                    dataset::Parser::new(file.format(), Arc::new(Schema::default()))
                        .map_err(|err| invalid(format!("phases[{idx}].timestamp_unit"), err))?;
                }
            }
        }
        if self.stats.bucket_millis == 0 {
            return Err(invalid("stats.bucket_millis", "must be at least 1"));
        }
        if let Some(histogram) = &self.stats.histogram {
            histogram
                .build()
                .map_err(|err| invalid("stats.histogram", err))?;
        }
        if let Sink::File { format, .. } = &self.sink {
            format
                .validate()
                .map_err(|err| invalid("sink.format.separator", err))?;
        }
        if let Sink::File { path_template, partitions, .. } = &self.sink
            && partitions.get() > 1
            && !path_template.contains(stampede_payload::partition::PLACEHOLDER)
        {
            return Err(invalid(
                "sink.path_template",
                format!("must contain {} for more than one partition", stampede_payload::partition::PLACEHOLDER),
            ));
        }
        Ok(())
    }
}

fn nest(idx: usize, err: Error) -> Error {
    match err {
        Error::InvalidParameter { name, reason } => Error::InvalidParameter {
            name: format!("phases[{idx}].{name}"),
            reason,
        },
        other => other,
    }
}

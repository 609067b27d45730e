//! Offline data generation
//!
//! Runs one synthetic phase to exhaustion without pacing and writes its events
//! round-robin into partition files in the dataset format. The files replay
//! with an external-file phase. Event timestamps are spaced by the phase's
//! mean inter-arrival time, so a replay with recorded timestamps reproduces
//! the phase's rate.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use stampede_payload::{
    Synthesizer,
    dataset::Format,
    partition::{self, Writer, generate_files},
    synth::derive_seed,
};
use tracing::info;

use crate::config::{self, Config, Phase, Synthetic};

/// Errors produced by [`generate`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The selected phase does not exist or is not synthetic.
    #[error("Phase {0} is not a synthetic phase")]
    NotSynthetic(usize),
    /// The configuration has no synthetic phase.
    #[error("No synthetic phase to generate")]
    NoSyntheticPhase,
    /// Partition files could not be written.
    #[error(transparent)]
    Partition(#[from] partition::Error),
}

#[derive(Debug, Clone)]
/// Where and how generated events are written.
pub struct Options {
    /// Path template, `%NNN%` is replaced by the partition number.
    pub template: String,
    /// Number of partition files.
    pub partitions: NonZeroUsize,
    /// Generating threads.
    pub threads: NonZeroUsize,
    /// Index of the phase to generate, the first synthetic phase if absent.
    pub phase: Option<usize>,
    /// Record layout.
    pub format: Format,
}

/// Microseconds between consecutive events of `phase` across all workers.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn spacing(phase: &Synthetic) -> u64 {
    let seconds = match phase.throttle {
        stampede_throttle::Config::Stable { events_per_second } => 1.0 / events_per_second,
        stampede_throttle::Config::Sampled { interarrival } => interarrival.mean(),
        stampede_throttle::Config::AllOut => 0.001,
    };
    (seconds * 1e6).round().max(1.0) as u64
}

/// Generate the selected phase of `config` into partition files. The first
/// event is stamped `base`. Returns the number of events written.
///
/// # Errors
///
/// Returns an error if no synthetic phase is selected or a file cannot be
/// written.
pub fn generate(config: &Config, options: &Options, base: Duration) -> Result<u64, Error> {
    let (idx, phase) = match options.phase {
        Some(idx) => match config.phases.get(idx) {
            Some(Phase::Synthetic(phase)) => (idx, phase),
            _ => return Err(Error::NotSynthetic(idx)),
        },
        None => config
            .phases
            .iter()
            .enumerate()
            .find_map(|(idx, phase)| match phase {
                Phase::Synthetic(phase) => Some((idx, phase)),
                Phase::File(_) => None,
            })
            .ok_or(Error::NoSyntheticPhase)?,
    };
    let schema = config.schema()?;
    let mix = phase.mix(&schema, config.seed)?;
    // Same seed as the driver uses, so a live run and its dataset agree.
    let synth = Arc::new(Synthesizer::new(
        mix,
        phase.total_events,
        derive_seed(config.seed, &[idx as u64]),
    ));
    let writer = Writer::create(&options.template, options.partitions, options.format.clone())?;
    let spacing = spacing(phase);
    info!(
        phase = idx,
        events = phase.total_events,
        partitions = options.partitions.get(),
        threads = options.threads.get(),
        "generating"
    );
    let written = generate_files(&synth, writer, options.threads, |index| {
        base + Duration::from_micros(spacing.saturating_mul(index))
    })?;
    Ok(written)
}

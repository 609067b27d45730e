//! Synthetic event generation under a total event budget.
//!
//! A [`Synthesizer`] is shared between workers. It owns the budget counter,
//! the cooperative stop flag and the [`Mix`]. Each worker draws events through
//! its own [`Handle`] which holds that worker's attribute distributions, seeded
//! from the synthesizer seed and the worker index. Per-worker output is
//! reproducible and workers never contend on a generator.
//!
//! Every issued event carries a monotonically increasing index. Partitioned
//! outputs assign event `i` to partition `i % partitions`, an assignment that
//! does not depend on how workers interleave.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::debug;

use crate::{
    Distribution,
    event::{Event, Value},
    mix::Mix,
};

/// Errors produced by [`Synthesizer`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An attribute distribution could not be constructed.
    #[error(transparent)]
    Distribution(#[from] crate::distribution::Error),
}

#[derive(Debug)]
/// Produces events on demand until its budget is exhausted or it is stopped.
pub struct Synthesizer {
    mix: Mix,
    total: u64,
    issued: AtomicU64,
    stopped: AtomicBool,
    seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// An event together with the index it was issued at.
pub struct Issued {
    /// Zero-based issue index, unique within one [`Synthesizer`].
    pub index: u64,
    /// The generated event.
    pub event: Event,
}

impl Issued {
    /// The partition this event belongs to when output is split `partitions`
    /// ways.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition(&self, partitions: usize) -> usize {
        (self.index % partitions as u64) as usize
    }
}

impl Synthesizer {
    /// Create a new [`Synthesizer`] that will issue at most `total` events.
    #[must_use]
    pub fn new(mix: Mix, total: u64, seed: u64) -> Self {
        Self {
            mix,
            total,
            issued: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            seed,
        }
    }

    /// Build the per-worker [`Handle`] for worker `worker`.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute distribution fails to construct. This
    /// does not happen for event types that passed validation.
    pub fn handle(self: &Arc<Self>, worker: u32) -> Result<Handle, Error> {
        let mut samplers = Vec::with_capacity(self.mix.types().len());
        for (type_idx, kind) in self.mix.types().iter().enumerate() {
            let mut attributes = Vec::with_capacity(kind.attributes.len());
            for (attr_idx, attribute) in kind.attributes.iter().enumerate() {
                let sampler = match attribute.distribution {
                    Some(config) => {
                        let seed = derive_seed(
                            self.seed,
                            &[u64::from(worker), type_idx as u64, attr_idx as u64],
                        );
                        Some(Distribution::new(config, seed)?)
                    }
                    None => None,
                };
                attributes.push(sampler);
            }
            samplers.push(attributes);
        }
        debug!(worker, "synthesizer handle created");
        Ok(Handle {
            synth: Arc::clone(self),
            samplers,
        })
    }

    /// Claim the next issue index, `None` once the budget is spent. Never
    /// exceeds the budget regardless of the number of concurrent callers.
    fn claim(&self) -> Option<u64> {
        self.issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.total).then_some(n + 1)
            })
            .ok()
    }

    /// Fraction of the budget issued so far, in `[0, 1]`. An empty budget is
    /// complete.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.generated() as f64 / self.total as f64
    }

    /// Number of events issued so far.
    #[must_use]
    pub fn generated(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    /// The total event budget.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Ask every handle to stop issuing events. Events already issued are not
    /// revoked.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether [`Synthesizer::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether the budget has been fully issued.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.generated() >= self.total
    }

    /// The mix this synthesizer draws types from.
    #[must_use]
    pub fn mix(&self) -> &Mix {
        &self.mix
    }
}

#[derive(Debug)]
/// A single worker's view of a [`Synthesizer`].
pub struct Handle {
    synth: Arc<Synthesizer>,
    // Indexed by position in `Mix::types`, then by attribute position.
    samplers: Vec<Vec<Option<Distribution>>>,
}

impl Handle {
    /// Issue the next event. Returns `None` when the budget is exhausted or the
    /// synthesizer has been stopped; once `None` is returned for exhaustion it
    /// is returned forever.
    pub fn next_event(&mut self) -> Option<Issued> {
        if self.synth.is_stopped() {
            return None;
        }
        let index = self.synth.claim()?;
        let position = self.synth.mix.position(index);
        let kind = &self.synth.mix.types()[position];
        let values = kind
            .attributes
            .iter()
            .zip(self.samplers[position].iter_mut())
            .map(|(attribute, sampler)| match sampler {
                Some(dist) => Value::from_sample(attribute.datatype, dist.generate()),
                None => Value::zero(attribute.datatype),
            })
            .collect();
        Some(Issued {
            index,
            event: Event::new(Arc::clone(kind), values),
        })
    }

    /// The shared synthesizer behind this handle.
    #[must_use]
    pub fn synthesizer(&self) -> &Arc<Synthesizer> {
        &self.synth
    }
}

/// Mix `parts` into `base` with the splitmix64 finalizer, giving well spread,
/// reproducible seeds for sub-generators.
#[must_use]
pub fn derive_seed(base: u64, parts: &[u64]) -> u64 {
    let mut z = base;
    for part in parts {
        z = z
            .wrapping_add(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(part.wrapping_mul(0xBF58_476D_1CE4_E5B9));
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
    }
    z
}

//! Event type mix selection.
//!
//! A [`Mix`] decides which [`EventType`] is emitted next. Deterministic mixes
//! cycle through the configured types in order and ignore weights. Stochastic
//! mixes sample each type with probability proportional to its weight, weights
//! need not sum to one.
//!
//! Callers key every choice by an issue sequence number taken from a shared
//! atomic counter, see [`crate::Synthesizer`]. A deterministic mix maps the
//! sequence onto its order, so the cycle holds however workers interleave.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{
    SeedableRng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::SmallRng,
};
use serde::{Deserialize, Serialize};

use crate::event::EventType;

/// Errors produced by [`Mix`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A mix must name at least one event type.
    #[error("Mix must contain at least one event type")]
    Empty,
    /// Weights must be finite and not negative.
    #[error("Invalid weight {weight} for event type {event_type}")]
    InvalidParameter {
        /// Event type name.
        event_type: String,
        /// Offending weight.
        weight: f64,
    },
    /// A stochastic mix needs at least one strictly positive weight.
    #[error("Stochastic mix has no positive weight")]
    AllZero,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// One entry of a configured mix.
pub struct Weight {
    /// Name of the event type, must exist in the schema.
    pub event_type: String,
    /// Relative weight, not negative.
    pub weight: f64,
}

#[derive(Debug)]
enum Policy {
    Deterministic,
    Stochastic {
        index: WeightedIndex<f64>,
        rng: Mutex<SmallRng>,
    },
}

#[derive(Debug)]
/// Chooses the next event type to emit. Safe to share between workers.
pub struct Mix {
    types: Vec<Arc<EventType>>,
    policy: Policy,
}

impl Mix {
    /// Construct a new [`Mix`] over `entries` in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error if `entries` is empty, a weight is negative or not
    /// finite, or a stochastic mix has no positive weight.
    pub fn new(
        entries: Vec<(Arc<EventType>, f64)>,
        deterministic: bool,
        seed: u64,
    ) -> Result<Self, Error> {
        if entries.is_empty() {
            return Err(Error::Empty);
        }
        for (kind, weight) in &entries {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(Error::InvalidParameter {
                    event_type: kind.name.clone(),
                    weight: *weight,
                });
            }
        }
        let (types, weights): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let policy = if deterministic {
            Policy::Deterministic
        } else {
            Policy::Stochastic {
                index: WeightedIndex::new(&weights).map_err(|_| Error::AllZero)?,
                rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            }
        };
        Ok(Self { types, policy })
    }

    /// A deterministic, round-robin, mix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] if `types` is empty.
    pub fn deterministic(types: Vec<Arc<EventType>>) -> Result<Self, Error> {
        Self::new(types.into_iter().map(|t| (t, 1.0)).collect(), true, 0)
    }

    /// A stochastic, weighted, mix.
    ///
    /// # Errors
    ///
    /// See [`Mix::new`].
    pub fn stochastic(entries: Vec<(Arc<EventType>, f64)>, seed: u64) -> Result<Self, Error> {
        Self::new(entries, false, seed)
    }

    /// Position in [`Mix::types`] of the type for the event issued at
    /// `sequence`. Stochastic mixes ignore `sequence` and sample.
    pub fn position(&self, sequence: u64) -> usize {
        match &self.policy {
            Policy::Deterministic => self.cycle(sequence),
            Policy::Stochastic { index, rng } => index.sample(&mut *rng.lock()),
        }
    }

    /// The configured types, in order.
    #[must_use]
    pub fn types(&self) -> &[Arc<EventType>] {
        &self.types
    }

    #[allow(clippy::cast_possible_truncation)]
    fn cycle(&self, sequence: u64) -> usize {
        // `types` is non-empty, see `new`.
        (sequence % self.types.len() as u64) as usize
    }
}

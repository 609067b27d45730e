//! Seeded value distributions.
//!
//! A [`Distribution`] is the source of both inter-arrival times and synthetic
//! attribute values. Every variant owns its own generator so that each worker
//! may hold an independently seeded instance; output is deterministic for a
//! fixed seed and call sequence.

use rand::{
    Rng, SeedableRng,
    distr::{Open01, Uniform},
    rngs::SmallRng,
};
use rand_distr::{Distribution as _, Normal};
use serde::{Deserialize, Serialize};

/// Errors produced by [`Distribution`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// A distribution parameter is out of its legal domain.
    #[error("Invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        /// The name of the offending parameter.
        name: &'static str,
        /// The value supplied.
        value: f64,
        /// What the parameter must satisfy.
        reason: &'static str,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration of a [`Distribution`]. Holds parameters only, no generator.
pub enum Config {
    /// Always produce `value`.
    Constant {
        /// The fixed value.
        value: f64,
    },
    /// Produce values in `[lower, upper)`.
    Uniform {
        /// Inclusive lower bound.
        lower: f64,
        /// Exclusive upper bound.
        upper: f64,
    },
    /// Gaussian with the given mean and standard deviation.
    Normal {
        /// The mean.
        mean: f64,
        /// The standard deviation, must not be negative.
        stdev: f64,
    },
    /// Exponential with rate `lambda`, mean `1 / lambda`.
    Exponential {
        /// The rate, must be strictly positive.
        lambda: f64,
    },
}

impl Config {
    /// Check the parameters of this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `stdev` is negative, `lambda` is
    /// not strictly positive, `upper` is below `lower` or any parameter is not
    /// finite.
    pub fn validate(&self) -> Result<(), Error> {
        match *self {
            Config::Constant { value } => finite("value", value),
            Config::Uniform { lower, upper } => {
                finite("lower", lower)?;
                finite("upper", upper)?;
                if upper < lower {
                    return Err(Error::InvalidParameter {
                        name: "upper",
                        value: upper,
                        reason: "must be greater than or equal to lower",
                    });
                }
                Ok(())
            }
            Config::Normal { mean, stdev } => {
                finite("mean", mean)?;
                finite("stdev", stdev)?;
                if stdev < 0.0 {
                    return Err(Error::InvalidParameter {
                        name: "stdev",
                        value: stdev,
                        reason: "must not be negative",
                    });
                }
                Ok(())
            }
            Config::Exponential { lambda } => {
                finite("lambda", lambda)?;
                if lambda <= 0.0 {
                    return Err(Error::InvalidParameter {
                        name: "lambda",
                        value: lambda,
                        reason: "must be strictly positive",
                    });
                }
                Ok(())
            }
        }
    }

    /// The expected value of this configuration.
    #[must_use]
    pub fn mean(&self) -> f64 {
        match *self {
            Config::Constant { value } => value,
            Config::Uniform { lower, upper } => lower + (upper - lower) / 2.0,
            Config::Normal { mean, .. } => mean,
            Config::Exponential { lambda } => 1.0 / lambda,
        }
    }

    /// The smallest value this configuration can produce. A normal with
    /// spread is unbounded below.
    #[must_use]
    pub fn lowest(&self) -> f64 {
        match *self {
            Config::Constant { value } => value,
            Config::Uniform { lower, .. } => lower,
            Config::Normal { mean, stdev } if stdev == 0.0 => mean,
            Config::Normal { .. } => f64::NEG_INFINITY,
            Config::Exponential { .. } => 0.0,
        }
    }
}

fn finite(name: &'static str, value: f64) -> Result<(), Error> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            value,
            reason: "must be finite",
        })
    }
}

#[derive(Debug, Clone)]
enum Kind {
    Constant(f64),
    // A degenerate uniform where lower == upper has no legal sample; it
    // collapses to `Constant`.
    Uniform(Uniform<f64>),
    Normal(Normal<f64>),
    Exponential { lambda: f64 },
}

#[derive(Debug, Clone)]
/// A seeded source of `f64` values.
///
/// Sampling requires `&mut self`: a single instance is never shared between
/// workers. Give each worker its own instance, see
/// [`Distribution::with_seed`].
pub struct Distribution {
    kind: Kind,
    seed: u64,
    rng: SmallRng,
}

impl Distribution {
    /// Create a new [`Distribution`] from `config`, seeded with `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `config` does not validate.
    pub fn new(config: Config, seed: u64) -> Result<Self, Error> {
        config.validate()?;
        let kind = match config {
            Config::Constant { value } => Kind::Constant(value),
            Config::Uniform { lower, upper } => match Uniform::new(lower, upper) {
                Ok(uniform) => Kind::Uniform(uniform),
                Err(_) => Kind::Constant(lower),
            },
            Config::Normal { mean, stdev } => {
                Kind::Normal(
                    Normal::new(mean, stdev).map_err(|_| Error::InvalidParameter {
                        name: "stdev",
                        value: stdev,
                        reason: "must be finite and not negative",
                    })?,
                )
            }
            Config::Exponential { lambda } => Kind::Exponential { lambda },
        };
        Ok(Self {
            kind,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    /// Constant distribution, always `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `value` is not finite.
    pub fn constant(value: f64) -> Result<Self, Error> {
        Self::new(Config::Constant { value }, 0)
    }

    /// Uniform distribution over `[lower, upper)`.
    ///
    /// # Errors
    ///
    /// See [`Config::validate`].
    pub fn uniform(seed: u64, lower: f64, upper: f64) -> Result<Self, Error> {
        Self::new(Config::Uniform { lower, upper }, seed)
    }

    /// Normal distribution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `stdev` is negative.
    pub fn normal(seed: u64, mean: f64, stdev: f64) -> Result<Self, Error> {
        Self::new(Config::Normal { mean, stdev }, seed)
    }

    /// Exponential distribution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `lambda` is not strictly
    /// positive.
    pub fn exponential(seed: u64, lambda: f64) -> Result<Self, Error> {
        Self::new(Config::Exponential { lambda }, seed)
    }

    /// Draw the next value.
    pub fn generate(&mut self) -> f64 {
        match &self.kind {
            Kind::Constant(value) => *value,
            Kind::Uniform(uniform) => uniform.sample(&mut self.rng),
            Kind::Normal(normal) => normal.sample(&mut self.rng),
            Kind::Exponential { lambda } => {
                // Inverse CDF. Open01 excludes both 0 and 1 so the result is
                // finite and strictly positive.
                let u: f64 = self.rng.sample(Open01);
                -(1.0 / lambda) * u.ln()
            }
        }
    }

    /// Restart the generator from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
    }

    /// A fresh instance with the same parameters, seeded with `seed`.
    #[must_use]
    pub fn with_seed(&self, seed: u64) -> Self {
        let mut other = self.clone();
        other.reseed(seed);
        other
    }

    /// The seed this instance was last seeded with.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::{Config, Distribution, Error};

    proptest! {
        #[test]
        fn exponential_strictly_positive(seed: u64, lambda in 0.001f64..1_000.0) {
            let mut dist = Distribution::exponential(seed, lambda).unwrap();
            for _ in 0..256 {
                let v = dist.generate();
                prop_assert!(v > 0.0, "{v} not strictly positive");
                prop_assert!(v.is_finite());
            }
        }

        #[test]
        fn uniform_in_half_open_range(seed: u64, lower in -1_000.0f64..1_000.0, span in 0.001f64..1_000.0) {
            let upper = lower + span;
            let mut dist = Distribution::uniform(seed, lower, upper).unwrap();
            for _ in 0..256 {
                let v = dist.generate();
                prop_assert!(v >= lower && v < upper, "{v} not in [{lower}, {upper})");
            }
        }

        #[test]
        fn same_seed_same_sequence(seed: u64, mean in -100.0f64..100.0, stdev in 0.0f64..50.0) {
            let mut a = Distribution::normal(seed, mean, stdev).unwrap();
            let mut b = Distribution::normal(seed, mean, stdev).unwrap();
            for _ in 0..64 {
                prop_assert_eq!(a.generate().to_bits(), b.generate().to_bits());
            }
        }

        #[test]
        fn non_positive_lambda_rejected(seed: u64, lambda in -1_000.0f64..=0.0) {
            let res = Distribution::exponential(seed, lambda);
            let is_invalid = matches!(res, Err(Error::InvalidParameter { name: "lambda", .. }));
            prop_assert!(is_invalid);
        }

        #[test]
        fn negative_stdev_rejected(seed: u64, stdev in -1_000.0f64..-0.0001) {
            let res = Distribution::normal(seed, 0.0, stdev);
            let is_invalid = matches!(res, Err(Error::InvalidParameter { name: "stdev", .. }));
            prop_assert!(is_invalid);
        }
    }

    #[test]
    fn constant_is_constant() {
        let mut dist = Distribution::constant(42.5).unwrap();
        for _ in 0..10 {
            assert!((dist.generate() - 42.5).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn zero_stdev_normal_is_mean() {
        let mut dist = Distribution::normal(7, 3.0, 0.0).unwrap();
        for _ in 0..10 {
            assert!((dist.generate() - 3.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn degenerate_uniform_returns_lower() {
        let mut dist = Distribution::uniform(7, 5.0, 5.0).unwrap();
        assert!((dist.generate() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn inverted_uniform_rejected() {
        assert!(Distribution::uniform(7, 5.0, 4.0).is_err());
    }

    #[test]
    fn exponential_mean_close_to_inverse_lambda() {
        let lambda = 10.0;
        let mut dist = Distribution::exponential(42, lambda).unwrap();
        let samples = 10_000;
        let mean = (0..samples).map(|_| dist.generate()).sum::<f64>() / f64::from(samples);
        let expected = 1.0 / lambda;
        assert!(
            (mean - expected).abs() < expected * 0.05,
            "mean {mean} not within 5% of {expected}"
        );
    }

    #[test]
    fn reseed_restarts_sequence() {
        let mut dist = Distribution::uniform(1, 0.0, 1.0).unwrap();
        let first: Vec<f64> = (0..8).map(|_| dist.generate()).collect();
        dist.reseed(1);
        let second: Vec<f64> = (0..8).map(|_| dist.generate()).collect();
        assert_eq!(first, second);
        assert_eq!(dist.seed(), 1);
    }

    #[test]
    fn with_seed_forks_independent_instance() {
        let base = Distribution::uniform(1, 0.0, 1.0).unwrap();
        let mut a = base.with_seed(2);
        let mut b = base.with_seed(3);
        let a: Vec<f64> = (0..8).map(|_| a.generate()).collect();
        let b: Vec<f64> = (0..8).map(|_| b.generate()).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn config_round_trips_through_yaml_shape() {
        let config: Config = serde_json::from_str(r#"{"exponential":{"lambda":2.0}}"#).unwrap();
        assert_eq!(config, Config::Exponential { lambda: 2.0 });
        assert!((config.mean() - 0.5).abs() < f64::EPSILON);
    }
}

//! Fixed-bucket response time histogram.
//!
//! Buckets span `[min, max]` with a fixed width. Bucket `i` holds values up to
//! `min + (i - 1) * width`; values below the range collapse into the first
//! bucket and values above it into the last, whose upper bound is reported as
//! infinity.

use serde::Serialize;

/// Errors produced by [`Histogram`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// A histogram parameter is out of its legal domain.
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

#[derive(Debug, Clone, PartialEq, Serialize)]
/// A histogram with a fixed number of equal-width buckets.
pub struct Histogram {
    min: f64,
    width: f64,
    counts: Vec<u64>,
    processed: u64,
    cumulative: bool,
}

impl Histogram {
    /// Buckets of `width` over `[min, max]`, plus one underflow and one
    /// overflow bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the range is empty or inverted,
    /// or `width` is not strictly positive.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_bucket_width(min: f64, max: f64, width: f64) -> Result<Self, Error> {
        check_range(min, max)?;
        if !(width.is_finite() && width > 0.0) {
            return Err(Error::InvalidParameter {
                name: "width",
                value: width,
                reason: "must be finite and strictly positive",
            });
        }
        let buckets = ((max - min) / width).ceil() as usize + 2;
        Ok(Self::build(min, width, buckets))
    }

    /// `buckets` buckets over `[min, max]`, the first and last of which take
    /// underflow and overflow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the range is empty or inverted,
    /// or `buckets` is below three.
    pub fn with_bucket_count(min: f64, max: f64, buckets: usize) -> Result<Self, Error> {
        check_range(min, max)?;
        if buckets < 3 {
            return Err(Error::InvalidParameter {
                name: "buckets",
                value: buckets as f64,
                reason: "must be at least 3",
            });
        }
        let width = (max - min) / (buckets - 2) as f64;
        Ok(Self::build(min, width, buckets))
    }

    fn build(min: f64, width: f64, buckets: usize) -> Self {
        Self {
            min,
            width,
            counts: vec![0; buckets],
            processed: 0,
            cumulative: false,
        }
    }

    /// Report cumulative rather than per-bucket frequencies.
    #[must_use]
    pub fn cumulative(mut self, cumulative: bool) -> Self {
        self.cumulative = cumulative;
        self
    }

    /// Count `x` into its bucket.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_item(&mut self, x: f64) {
        let last = self.counts.len() - 1;
        let raw = ((x - self.min) / self.width).ceil() + 1.0;
        // NaN lands in the overflow bucket.
        let idx = if raw.is_nan() {
            last
        } else {
            raw.clamp(0.0, last as f64) as usize
        };
        self.counts[idx] += 1;
        self.processed += 1;
    }

    /// Bucket upper bound to frequency, in bucket order. Frequencies are
    /// normalized by [`Histogram::processed_count`] and accumulate in
    /// cumulative mode. The last bound is infinity. An empty histogram reports
    /// zero everywhere.
    #[must_use]
    pub fn histogram(&self) -> Vec<(f64, f64)> {
        let last = self.counts.len() - 1;
        let mut running = 0.0;
        self.counts
            .iter()
            .enumerate()
            .map(|(i, count)| {
                let bound = if i == last {
                    f64::INFINITY
                } else {
                    self.min + (i as f64 - 1.0) * self.width
                };
                let freq = if self.processed == 0 {
                    0.0
                } else {
                    *count as f64 / self.processed as f64
                };
                if self.cumulative {
                    running += freq;
                    (bound, running)
                } else {
                    (bound, freq)
                }
            })
            .collect()
    }

    /// Raw counts per bucket.
    #[must_use]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Number of [`Histogram::add_item`] calls.
    #[must_use]
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Zero every bucket.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.processed = 0;
    }
}

fn check_range(min: f64, max: f64) -> Result<(), Error> {
    if !min.is_finite() {
        return Err(Error::InvalidParameter {
            name: "min",
            value: min,
            reason: "must be finite",
        });
    }
    if !(max.is_finite() && max > min) {
        return Err(Error::InvalidParameter {
            name: "max",
            value: max,
            reason: "must be finite and greater than min",
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use proptest::{collection, prelude::*};

    use super::{Error, Histogram};

    proptest! {
        #[test]
        fn counts_sum_to_calls(items in collection::vec(-50.0f64..150.0, 0..500), buckets in 3usize..40) {
            let mut hist = Histogram::with_bucket_count(0.0, 100.0, buckets).unwrap();
            for x in &items {
                hist.add_item(*x);
            }
            prop_assert_eq!(hist.counts().iter().sum::<u64>(), items.len() as u64);
            prop_assert_eq!(hist.processed_count(), items.len() as u64);
            let denormalized: f64 = hist
                .histogram()
                .iter()
                .map(|(_, f)| f * items.len() as f64)
                .sum();
            prop_assert!((denormalized - items.len() as f64).abs() < 1e-6);
        }

        #[test]
        fn cumulative_is_monotone_and_ends_at_one(items in collection::vec(-10.0f64..20.0, 1..300), width in 0.1f64..5.0) {
            let mut hist = Histogram::with_bucket_width(0.0, 10.0, width).unwrap().cumulative(true);
            for x in &items {
                hist.add_item(*x);
            }
            let entries = hist.histogram();
            prop_assert!(entries.windows(2).all(|w| w[0].1 <= w[1].1 + 1e-12));
            let (bound, total) = entries[entries.len() - 1];
            prop_assert!(bound.is_infinite());
            prop_assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn bucket_index_follows_ceiling() {
        let mut hist = Histogram::with_bucket_width(0.0, 10.0, 1.0).unwrap();
        assert_eq!(hist.counts().len(), 12);
        hist.add_item(-5.0); // underflow
        hist.add_item(0.0); // ceil(0) + 1
        hist.add_item(0.5); // ceil(0.5) + 1
        hist.add_item(3.0); // ceil(3) + 1
        hist.add_item(1_000.0); // overflow
        assert_eq!(hist.counts()[0], 1);
        assert_eq!(hist.counts()[1], 1);
        assert_eq!(hist.counts()[2], 1);
        assert_eq!(hist.counts()[4], 1);
        assert_eq!(hist.counts()[11], 1);

        let entries = hist.histogram();
        assert!((entries[4].0 - 3.0).abs() < f64::EPSILON);
        assert!((entries[4].1 - 0.2).abs() < f64::EPSILON);
        assert!(entries[11].0.is_infinite());
    }

    #[test]
    fn empty_histogram_reports_zeros() {
        let hist = Histogram::with_bucket_count(0.0, 1.0, 4).unwrap();
        assert!(hist.histogram().iter().all(|(_, f)| *f == 0.0));
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(matches!(
            Histogram::with_bucket_count(0.0, 1.0, 2),
            Err(Error::InvalidParameter { name: "buckets", .. })
        ));
        assert!(matches!(
            Histogram::with_bucket_width(1.0, 1.0, 0.5),
            Err(Error::InvalidParameter { name: "max", .. })
        ));
        assert!(matches!(
            Histogram::with_bucket_width(0.0, 1.0, 0.0),
            Err(Error::InvalidParameter { name: "width", .. })
        ));
    }

    #[test]
    fn reset_clears_counts() {
        let mut hist = Histogram::with_bucket_count(0.0, 1.0, 4).unwrap();
        hist.add_item(0.5);
        hist.reset();
        assert_eq!(hist.processed_count(), 0);
        assert!(hist.counts().iter().all(|c| *c == 0));
    }
}

//! The stampede throttle mechanism
//!
//! This library decides when each worker emits its next event. Open-loop
//! throttles space events by a fixed rate or by inter-arrival times drawn from
//! a distribution; replay throttles wait for offsets recorded in a dataset.
//! Either way the schedule advances from scheduled instants, see
//! [`schedule::Cursor`], so a worker that falls behind catches up without
//! shifting the rest of its schedule.
//!
//! Waits are taken in slices of at most [`QUANTUM`] and the caller's
//! cancellation check runs before every slice. A wait in progress therefore
//! observes cancellation no later than one quantum after it is requested.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::num::NonZeroU32;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stampede_payload::{Distribution, distribution};
use tokio::time::{self, Duration, Instant};
use tracing::debug;

pub mod schedule;

use schedule::Cursor;

/// Ticks per second. A tick is one microsecond.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

/// Longest single sleep a throttle takes before re-checking cancellation.
pub const QUANTUM: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of an open-loop throttle.
#[serde(rename_all = "snake_case")]
pub enum Config {
    /// A throttle that allows the user to produce as fast as possible.
    AllOut,
    /// A fixed rate, spread evenly over the workers of a phase.
    Stable {
        /// Events per second summed over every worker.
        events_per_second: f64,
    },
    /// Inter-arrival times drawn from a distribution, in seconds. Each worker
    /// draws its own gaps, scaled so the phase as a whole keeps the
    /// distribution's rate. The distribution must not produce negative gaps.
    Sampled {
        /// The inter-arrival distribution.
        interarrival: distribution::Config,
    },
}

impl Config {
    /// Check the parameters of this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a rate that is not finite and
    /// strictly positive, [`Error::NegativeGaps`] for an inter-arrival
    /// distribution that can produce negative gaps, or the distribution error
    /// for an invalid inter-arrival distribution.
    pub fn validate(&self) -> Result<(), Error> {
        match *self {
            Config::AllOut => Ok(()),
            Config::Stable { events_per_second } => {
                if events_per_second.is_finite() && events_per_second > 0.0 {
                    Ok(())
                } else {
                    Err(Error::InvalidParameter {
                        name: "events_per_second",
                        value: events_per_second,
                    })
                }
            }
            Config::Sampled { interarrival } => {
                interarrival.validate()?;
                if interarrival.lowest() < 0.0 {
                    return Err(Error::NegativeGaps(interarrival));
                }
                let mean = interarrival.mean();
                if mean > 0.0 {
                    Ok(())
                } else {
                    Err(Error::InvalidParameter {
                        name: "interarrival",
                        value: mean,
                    })
                }
            }
        }
    }
}

/// Errors produced by [`Throttle`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// A rate parameter is out of its legal domain.
    #[error("Invalid parameter {name} = {value}, must be finite and strictly positive")]
    InvalidParameter {
        /// The name of the offending parameter.
        name: &'static str,
        /// The value supplied.
        value: f64,
    },
    /// The inter-arrival distribution can produce negative gaps.
    #[error("Inter-arrival distribution {0:?} can produce negative gaps")]
    NegativeGaps(distribution::Config),
    /// The inter-arrival distribution is invalid.
    #[error(transparent)]
    Distribution(#[from] distribution::Error),
}

#[async_trait]
/// The `Clock` used for every throttle
pub trait Clock {
    /// The number of ticks elapsed since the clock was created
    fn ticks_elapsed(&self) -> u64;
    /// Wait for `ticks` amount of time
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    /// Return the number of ticks since `Clock` was created, saturating at
    /// `u64::MAX`.
    fn ticks_elapsed(&self) -> u64 {
        let ticks_since: u128 = Instant::now().duration_since(self.start).as_micros();
        u64::try_from(ticks_since).unwrap_or(u64::MAX)
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of a wait.
pub enum Slot {
    /// The scheduled instant has arrived. `lag` is how many ticks late the
    /// caller is, zero when on time.
    Due {
        /// Ticks past the scheduled instant.
        lag: u64,
    },
    /// The caller's cancellation check fired before the instant arrived.
    Cancelled,
}

#[derive(Debug)]
enum Gap {
    None,
    Fixed(u64),
    Sampled { distribution: Distribution, scale: f64 },
}

impl Gap {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn next(&mut self) -> u64 {
        match self {
            Gap::None => 0,
            Gap::Fixed(ticks) => *ticks,
            Gap::Sampled {
                distribution,
                scale,
            } => (distribution.generate() * *scale).round() as u64,
        }
    }
}

/// The throttle mechanism
///
/// One `Throttle` paces one worker. Construct every worker's throttle with
/// the same `workers` count so their combined rate matches the configured
/// rate.
#[derive(Debug)]
pub struct Throttle<C = RealClock> {
    clock: C,
    cursor: Cursor,
    // Tick at which replay offset zero falls.
    origin: u64,
    gap: Gap,
}

impl Throttle<RealClock> {
    /// Create a new open-loop `Throttle` with a real-time clock.
    ///
    /// # Errors
    ///
    /// See [`Config::validate`].
    pub fn new_with_config(config: Config, seed: u64, workers: NonZeroU32) -> Result<Self, Error> {
        Self::with_clock(config, seed, workers, RealClock::default())
    }

    /// Create a new replay `Throttle` with a real-time clock.
    #[must_use]
    pub fn replay() -> Self {
        Self::replay_with_clock(RealClock::default())
    }
}

impl<C> Throttle<C>
where
    C: Clock + Sync + Send,
{
    /// Create a new open-loop `Throttle` on `clock`.
    ///
    /// # Errors
    ///
    /// See [`Config::validate`].
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_clock(
        config: Config,
        seed: u64,
        workers: NonZeroU32,
        clock: C,
    ) -> Result<Self, Error> {
        config.validate()?;
        let workers = f64::from(workers.get());
        let gap = match config {
            Config::AllOut => Gap::None,
            Config::Stable { events_per_second } => {
                let ticks = (TICKS_PER_SECOND as f64 * workers / events_per_second).round();
                Gap::Fixed((ticks as u64).max(1))
            }
            Config::Sampled { interarrival } => Gap::Sampled {
                distribution: Distribution::new(interarrival, seed)?,
                scale: TICKS_PER_SECOND as f64 * workers,
            },
        };
        debug!(?config, "throttle created");
        let now = clock.ticks_elapsed();
        Ok(Self {
            clock,
            cursor: Cursor::new(now),
            origin: now,
            gap,
        })
    }

    /// Create a new replay `Throttle` on `clock`. Replay offsets are measured
    /// from the moment of creation.
    pub fn replay_with_clock(clock: C) -> Self {
        let now = clock.ticks_elapsed();
        Self {
            clock,
            cursor: Cursor::new(now),
            origin: now,
            gap: Gap::None,
        }
    }

    /// Wait for the next open-loop instant. The first call returns at once.
    /// `cancelled` is checked before every sleep.
    pub async fn wait<F>(&mut self, cancelled: F) -> Slot
    where
        F: Fn() -> bool + Send + Sync,
    {
        let slot = self.wait_due(&cancelled).await;
        if let Slot::Due { .. } = slot {
            let gap = self.gap.next();
            self.cursor.advance(gap);
        }
        slot
    }

    /// Wait until `offset` past the replay origin. `cancelled` is checked
    /// before every sleep.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn wait_until<F>(&mut self, offset: Duration, cancelled: F) -> Slot
    where
        F: Fn() -> bool + Send + Sync,
    {
        let offset = u64::try_from(offset.as_micros()).unwrap_or(u64::MAX);
        self.cursor.set(self.origin.saturating_add(offset));
        self.wait_due(&cancelled).await
    }

    /// Restart the schedule at the current instant. Time spent not waiting,
    /// such as a pause, is not caught up as a burst; replay offsets shift by
    /// the same amount. Returns the time discarded.
    pub fn rebase(&mut self) -> Duration {
        let now = self.clock.ticks_elapsed();
        let skipped = self.cursor.rebase(now);
        self.origin = self.origin.saturating_add(skipped);
        debug!(skipped_micros = skipped, "throttle rebased");
        Duration::from_micros(skipped)
    }

    async fn wait_due<F>(&mut self, cancelled: &F) -> Slot
    where
        F: Fn() -> bool + Send + Sync,
    {
        let quantum = u64::try_from(QUANTUM.as_micros()).unwrap_or(u64::MAX);
        loop {
            let now = self.clock.ticks_elapsed();
            let slop = self.cursor.slop(now);
            if slop == 0 {
                return Slot::Due {
                    lag: self.cursor.lag(now),
                };
            }
            if cancelled() {
                return Slot::Cancelled;
            }
            self.clock.wait(slop.min(quantum)).await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        num::NonZeroU32,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    };

    use stampede_payload::distribution;
    use tokio::time::{self, Duration, Instant};

    use super::{Config, Error, QUANTUM, Slot, Throttle};

    fn one() -> NonZeroU32 {
        NonZeroU32::new(1).unwrap()
    }

    fn never() -> bool {
        false
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff <= Duration::from_millis(1), "{actual:?} != {expected:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stable_rate_converges_after_stall() {
        let mut throttle = Throttle::new_with_config(
            Config::Stable {
                events_per_second: 100.0,
            },
            0,
            one(),
        )
        .unwrap();
        let start = Instant::now();
        let mut sent = 0;
        loop {
            assert!(matches!(throttle.wait(never).await, Slot::Due { .. }));
            if start.elapsed() >= Duration::from_secs(1) {
                break;
            }
            sent += 1;
            if sent == 10 {
                time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert!((99..=101).contains(&sent), "sent {sent}");
    }

    #[tokio::test(start_paused = true)]
    async fn late_caller_reports_lag() {
        let mut throttle = Throttle::new_with_config(
            Config::Stable {
                events_per_second: 10.0,
            },
            0,
            one(),
        )
        .unwrap();
        throttle.wait(never).await;
        time::sleep(Duration::from_millis(350)).await;
        match throttle.wait(never).await {
            Slot::Due { lag } => assert!((249_000..=251_000).contains(&lag), "lag {lag}"),
            Slot::Cancelled => panic!("not cancelled"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_observed_within_one_quantum() {
        let mut throttle = Throttle::new_with_config(
            Config::Stable {
                events_per_second: 0.1,
            },
            0,
            one(),
        )
        .unwrap();
        throttle.wait(never).await;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::Relaxed);
        });
        let start = Instant::now();
        let slot = throttle.wait(|| stop.load(Ordering::Relaxed)).await;
        assert_eq!(slot, Slot::Cancelled);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed <= Duration::from_secs(1) + QUANTUM, "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn rebase_skips_paused_time() {
        let mut throttle = Throttle::new_with_config(
            Config::Stable {
                events_per_second: 10.0,
            },
            0,
            one(),
        )
        .unwrap();
        throttle.wait(never).await;
        time::sleep(Duration::from_secs(5)).await;
        assert_close(throttle.rebase(), Duration::from_millis(4_900));

        let start = Instant::now();
        throttle.wait(never).await;
        throttle.wait(never).await;
        assert_close(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn workers_share_the_rate() {
        let mut throttle = Throttle::new_with_config(
            Config::Stable {
                events_per_second: 100.0,
            },
            0,
            NonZeroU32::new(4).unwrap(),
        )
        .unwrap();
        throttle.wait(never).await;
        let start = Instant::now();
        throttle.wait(never).await;
        assert_close(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_waits_for_offsets() {
        let mut throttle = Throttle::replay();
        let start = Instant::now();
        for offset in [0, 250, 1_000] {
            let slot = throttle
                .wait_until(Duration::from_millis(offset), never)
                .await;
            assert!(matches!(slot, Slot::Due { .. }));
            assert_close(start.elapsed(), Duration::from_millis(offset));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sampled_rate_matches_mean() {
        let mut throttle = Throttle::new_with_config(
            Config::Sampled {
                interarrival: distribution::Config::Exponential { lambda: 100.0 },
            },
            7,
            one(),
        )
        .unwrap();
        let start = Instant::now();
        let mut sent = 0u32;
        while start.elapsed() < Duration::from_secs(10) {
            throttle.wait(never).await;
            sent += 1;
        }
        assert!((900..=1_100).contains(&sent), "sent {sent}");
    }

    #[tokio::test]
    async fn invalid_rates_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let res = Throttle::new_with_config(
                Config::Stable {
                    events_per_second: rate,
                },
                0,
                one(),
            );
            assert!(matches!(res, Err(Error::InvalidParameter { .. })));
        }
        let res = Throttle::new_with_config(
            Config::Sampled {
                interarrival: distribution::Config::Exponential { lambda: 0.0 },
            },
            0,
            one(),
        );
        assert!(matches!(res, Err(Error::Distribution(_))));
    }

    #[test]
    fn negative_gaps_rejected() {
        for interarrival in [
            distribution::Config::Normal {
                mean: 0.01,
                stdev: 0.02,
            },
            distribution::Config::Uniform {
                lower: -0.01,
                upper: 0.05,
            },
            distribution::Config::Constant { value: -1.0 },
        ] {
            let res = Throttle::new_with_config(Config::Sampled { interarrival }, 0, one());
            assert!(
                matches!(res, Err(Error::NegativeGaps(c)) if c == interarrival),
                "{interarrival:?}"
            );
        }
        for interarrival in [
            distribution::Config::Normal {
                mean: 0.01,
                stdev: 0.0,
            },
            distribution::Config::Uniform {
                lower: 0.0,
                upper: 0.02,
            },
            distribution::Config::Constant { value: 0.01 },
        ] {
            assert!(Config::Sampled { interarrival }.validate().is_ok(), "{interarrival:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn uniform_gaps_keep_their_rate() {
        let mut throttle = Throttle::new_with_config(
            Config::Sampled {
                interarrival: distribution::Config::Uniform {
                    lower: 0.0,
                    upper: 0.02,
                },
            },
            3,
            one(),
        )
        .unwrap();
        let start = Instant::now();
        let mut sent = 0u32;
        while start.elapsed() < Duration::from_secs(10) {
            throttle.wait(never).await;
            sent += 1;
        }
        assert!((950..=1_050).contains(&sent), "sent {sent}");
    }
}

//! Online performance statistics for stampede
//!
//! Response times arrive as pairs of input and output timestamps, keyed by a
//! [`Stream`]. [`OutStreamCounters`] keep running sufficient statistics for a
//! single stream, no raw samples are kept. [`SinkPerfStats`] groups the
//! counters of every stream seen by a sink and is snapshotted periodically by
//! the [`Recorder`] into [`PerformanceStats`] records, which the [`Reporter`]
//! writes out one JSON object per line.

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

pub mod counters;
pub mod histogram;
pub mod perf;
pub mod recorder;
pub mod reporter;
pub mod sink;
pub mod stream;

pub use counters::{OutStreamCounters, Resolution};
pub use histogram::Histogram;
pub use perf::PerformanceStats;
pub use recorder::Recorder;
pub use reporter::Reporter;
pub use sink::SinkPerfStats;
pub use stream::{Direction, Stream};

//! The stampede performance-testing harness.
//!
//! This library supports the stampede binary found elsewhere in this project.
//! A [`driver::Driver`] loads a workload of synthetic or replayed phases, runs
//! each phase with parallel [`worker::Worker`]s that inject events into a
//! [`sink::Sink`] at a controlled rate, and records response times reported to
//! the [`listener::Listener`] for periodic performance snapshots.

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

mod common;
pub mod config;
pub mod control;
pub mod datagen;
pub mod driver;
pub mod listener;
pub mod signals;
pub mod sink;
pub mod worker;

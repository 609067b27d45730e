//! The stampede payloads
//!
//! This library supports event generation for the stampede project: the event
//! schema, the value distributions attributes draw from, the selection of which
//! event type to emit next and the synthesizer that ties these together under a
//! total event budget. Recorded datasets are read back through [`dataset`] and
//! events cross the protocol boundary through [`converter`].

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

pub mod converter;
pub mod dataset;
pub mod distribution;
pub mod event;
pub mod mix;
pub mod partition;
pub mod synth;

pub use distribution::Distribution;
pub use event::{Attribute, Datatype, Event, EventType, Schema, Value};
pub use mix::Mix;
pub use synth::Synthesizer;

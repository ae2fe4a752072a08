//! # cadence-metrics
//!
//! Typed counters shared by the consensus core and the node.
//!
//! Counters are plain atomics indexed by [`CounterType`]. A replica holds an
//! `Arc<SystemCounters>`; tests and the node read them back through
//! [`SystemCounters::get`] or a [`CountersSnapshot`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod counters;
mod export;

pub use counters::{CounterType, SystemCounters};
pub use export::CountersSnapshot;

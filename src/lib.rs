//! Hierarchical Temporal Memory (HTM) sequence learning in Rust.
//!
//! The crate provides the three pieces every HTM pipeline exchanges data through:
//! - `core::sdr`: the sparse distributed representation (dense, sparse and coordinate formats).
//! - `core::connections`: the cell/segment/synapse graph with potential vs. connected bookkeeping.
//! - `core::temporal_memory`: the sequence learning algorithm built on top of `Connections`,
//!   together with the raw anomaly score in `core::anomaly`.

pub mod core;
pub mod error;

pub use error::{HtmError, Result};

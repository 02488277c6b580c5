//! Error type shared by every algorithm in the crate.
//!
//! All of the conditions the algorithms detect are programmer errors in how they were driven
//! (bad dimensions, out-of-range indices, invalid configuration, reading per-step state too early,
//! corrupt snapshots). None of them are retried or recovered from internally, they are returned
//! to the caller as-is.

use thiserror::Error;

/// Errors produced by SDRs, `Connections` and the `TemporalMemory`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HtmError {
    /// Two shapes that must agree did not.
    #[error("dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch { expected: Vec<u32>, actual: Vec<u32> },

    /// An index addressed something outside of its container.
    #[error("{what} index {index} out of range (size {size})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        size: usize,
    },

    /// A parameter or argument violates its documented constraints.
    #[error("invalid parameter `{name}`: {message}")]
    InvalidParameter { name: &'static str, message: String },

    /// An index space ran out of room.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(&'static str),

    /// Derived state was requested before the computation that produces it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A snapshot could not be written or read back.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A proxy was used after the SDR it views was dropped.
    #[error("the source SDR of this proxy has been dropped")]
    ProxySourceDropped,
}

impl HtmError {
    pub(crate) fn out_of_range(what: &'static str, index: usize, size: usize) -> Self {
        HtmError::IndexOutOfRange { what, index, size }
    }

    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        HtmError::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for HtmError {
    fn from(err: std::io::Error) -> Self {
        HtmError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for HtmError {
    fn from(err: bincode::Error) -> Self {
        HtmError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HtmError>;

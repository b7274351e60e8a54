//! Error kinds signaled by the core.
//!
//! Mirrors the error codes the original RT module returned to callers
//! (`EBUSY`, `E2BIG`, `EINVAL`, `ESRCH`, ...) but as a closed Rust enum
//! rather than bare `errno` values, so non-RT callers can match on it.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Operation attempted during init/teardown.
    NotReady,
    /// Resource already active (stimulator, channel in use).
    Busy,
    /// Bounded queue or heap full.
    NoSpace,
    /// Unknown command tag, out-of-range channel, null buffer when
    /// count > 0, invalid voltage for context.
    InvalidArgument(String),
    /// No voltage range brackets the requested voltage.
    RangeNotFound,
    /// Sampling rate below the minimum required for a feature.
    RateTooLow,
    /// Shared-memory region or FIFO could not be attached.
    ResourceMissing,
    /// Function not present in the callback registry.
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotReady => write!(f, "operation attempted during init/teardown"),
            Error::Busy => write!(f, "resource already active"),
            Error::NoSpace => write!(f, "bounded queue or heap is full"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::RangeNotFound => write!(f, "no voltage range brackets the requested voltage"),
            Error::RateTooLow => write!(f, "sampling rate too low for this feature"),
            Error::ResourceMissing => write!(f, "shared-memory region or FIFO unattached"),
            Error::NotFound => write!(f, "function not found in registry"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

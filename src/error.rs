//! Error handling for the allocator crate

use core::fmt;

/// Common error type used throughout the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The heap source cannot supply the requested bytes
    OutOfMemory,
    /// Invalid argument
    InvalidArgument(&'static str),
    /// Invalid state
    InvalidState(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

//! Kernel Status Codes
//!
//! Every fallible kernel service returns a `KResult`, carrying one of the
//! status codes below on failure. These are deliberately coarse: callers
//! branch on them, they are not a diagnostic channel.

use core::fmt;

/// Failure codes returned by kernel services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// An allocation failed. The attempted operation left no partial
    /// state behind; the caller may retry later.
    InsufficientResources,
    /// A handle number at or beyond the hard table maximum was requested,
    /// or growth arithmetic would overflow. This is a logical limit, not
    /// a transient shortage.
    TooManyHandles,
    /// A timed wait expired before the object was acquired.
    Timeout,
    /// A handle number was out of range or referred to a free slot.
    InvalidHandle,
}

/// Result alias used throughout the kernel
pub type KResult<T> = Result<T, Status>;

impl Status {
    /// Short printable name for diagnostics
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::InsufficientResources => "insufficient resources",
            Status::TooManyHandles => "too many handles",
            Status::Timeout => "timeout",
            Status::InvalidHandle => "invalid handle",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Error handling utils.
//!
//! Per the runtime's contract, a violated API invariant (joining a fiber
//! twice, readying a master fiber, calling a fiber-only primitive off a
//! fiber, ...) is a programming bug and results in a panic rather than an
//! `Err`. The [`Error`] type enumerated here only covers the handful of
//! outcomes which are not bugs: inconsistent configuration, a fiber name
//! that can't be represented as a `CString`, and timeouts bridged in from
//! lower-level primitives.

use std::fmt;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all fallible (non-panicking) outcomes of this crate's API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("fiber name must not contain interior NUL bytes: {0}")]
    InvalidFiberName(#[from] std::ffi::NulError),

    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::InvalidFiberName(_) => "InvalidFiberName",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Timeout => "Timeout",
            Self::Other(_) => "Other",
        }
    }
}

/// A single joint-consistency violation found by [`crate::config::RuntimeConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub(crate) String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Result of a timed wait: either the predicate was satisfied, or the
/// deadline elapsed first. Deliberately not [`Result`]: a timeout on a wait
/// is an expected outcome, not an error (see the distilled spec's §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeoutResult {
    Woken,
    TimedOut,
}

impl WaitTimeoutResult {
    pub fn timed_out(self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn woken(self) -> bool {
        matches!(self, Self::Woken)
    }
}

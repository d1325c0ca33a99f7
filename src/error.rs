//! Structured error kinds for all fallible operations.
//!
//! Every public operation returns [`Result`]; the variant is the error kind
//! and the payload is a human-readable message. No silent substitution of
//! defaults for invalid inputs.

use thiserror::Error;

/// Error kind plus message for every fallible proxima operation.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied parameter is out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The query or inserted vector dimension does not match the index.
    #[error("dimension mismatch: index has {expected}, got {actual}")]
    DimensionNotEqual { expected: usize, actual: usize },

    /// An allocation required by the operation could not be satisfied.
    #[error("not enough memory: {0}")]
    NoEnoughMemory(String),

    /// Deserialization input is corrupt, truncated, or from a different layout.
    #[error("invalid binary: {0}")]
    InvalidBinary(String),

    /// An invariant the implementation relies on was violated.
    #[error("internal error: {0}")]
    InternalError(String),

    /// The index has not been built yet.
    #[error("index has not been built")]
    NotBuilt,

    /// A build is already running (or has already completed) on this index.
    #[error("build in progress: {0}")]
    BuildInProgress(String),

    /// The operation is not supported by this index configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an allocation failure from `try_reserve` and friends.
    pub(crate) fn alloc(context: &str, err: impl std::fmt::Display) -> Self {
        Error::NoEnoughMemory(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_kind_and_detail() {
        let e = Error::DimensionNotEqual {
            expected: 128,
            actual: 64,
        };
        assert_eq!(e.to_string(), "dimension mismatch: index has 128, got 64");
        let e = Error::InvalidArgument("k must be > 0".into());
        assert!(e.to_string().contains("k must be > 0"));
    }
}

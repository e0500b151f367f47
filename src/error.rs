use std::{error::Error as StdError, fmt};

/// Errors returned by pool construction and submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The pool was configured with a capacity of zero.
    InvalidCapacity,

    /// The pool was configured with a zero idle timeout.
    InvalidIdleTimeout,

    /// The pool has been released and no longer accepts submissions.
    Closed,

    /// The common pool was already initialized when
    /// [`configure_common`](crate::configure_common) was called.
    AlreadyInitialized,
}

impl StdError for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidCapacity => f.write_str("pool capacity must be greater than zero"),
            Error::InvalidIdleTimeout => f.write_str("pool idle timeout must be greater than zero"),
            Error::Closed => f.write_str("pool has been released"),
            Error::AlreadyInitialized => f.write_str("common pool already initialized"),
        }
    }
}

//! Queue Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A queue error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for queued operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Every waiter of an operation receives its own copy of the outcome, hence
/// `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ErrorKind {
    /// Processing failed on every attempt.
    #[display("operation rejected after {attempts} attempt(s): {reason}")]
    Rejected {
        attempts: u32,
        #[error(not(source))]
        reason: String,
    },
    /// The queue went away before the operation settled.
    #[display("operation abandoned before it settled")]
    Abandoned,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

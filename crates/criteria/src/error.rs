//! Criteria Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A criteria error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for criteria parsing.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ErrorKind {
    /// Key suffix names an operator that does not exist.
    #[display("invalid expression ${_0}")]
    UnknownOperator(#[error(not(source))] String),
    /// Operator exists but the comparison value has the wrong shape.
    #[display("invalid criteria: {_0}")]
    InvalidCriteria(#[error(not(source))] String),
    /// Text form of the criteria is not valid JSON.
    #[display("criteria is not valid JSON")]
    Syntax,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

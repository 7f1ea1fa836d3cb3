//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use freeway_catalog::error::{Error as CatalogError, ErrorKind as CatalogErrorKind};
use std::path::PathBuf;

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("catalog operation failed")]
    Catalog,
    /// No piece has the requested id.
    #[display("piece not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The watch directory can't be created or isn't a directory.
    #[display("invalid watch directory: {}", _0.display())]
    Directory(#[error(not(source))] PathBuf),
    #[display("could not read {}", _0.display())]
    Read(#[error(not(source))] PathBuf),
    #[display("could not watch {}", _0.display())]
    Watch(#[error(not(source))] PathBuf),
    /// A piece link can't be created, removed or listed.
    #[display("could not maintain link {}", _0.display())]
    Link(#[error(not(source))] PathBuf),
    #[display("watcher already started")]
    AlreadyStarted,
    /// Upload job failed on every attempt.
    #[display("upload failed")]
    Upload,
    /// The asset service refused or failed a request.
    #[display("asset service error: {_0}")]
    Remote(#[error(not(source))] String),
}

impl ErrorKind {
    /// Wrap a catalog error, keeping "not found" distinguishable.
    #[track_caller]
    pub(crate) fn catalog(err: CatalogError) -> Error {
        let kind = match &*err {
            CatalogErrorKind::PieceNotFound(id) => Self::NotFound(id.clone()),
            _ => Self::Catalog,
        };
        err.raise(kind)
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Catalog | Self::Read(_) | Self::Link(_) | Self::Upload | Self::Remote(_))
    }
}

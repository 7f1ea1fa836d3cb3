//! Command Error Types

use derive_more::{Display, Error};

pub type Result<T> = std::result::Result<T, exn::Exn<ErrorKind>>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the catalog")]
    Catalog,
    #[display("invalid --criteria")]
    Criteria,
    #[display("library failed")]
    Library,
    #[display("could not listen for Ctrl-C")]
    Signal,
    #[display("could not write output")]
    Output,
}

impl ErrorKind {
    /// Returns `true` if running the command again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Catalog | Self::Library | Self::Output)
    }
}

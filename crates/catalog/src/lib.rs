//! The piece catalog: records for every tracked file, the JSON document they
//! persist to, and content hashing used to tell when a file really changed.

mod catalog;
pub mod error;
mod hash;
mod kind;
mod piece;

pub use crate::catalog::{Catalog, CatalogOptions};
pub use crate::hash::hash_file;
pub use crate::kind::PieceType;
pub use crate::piece::{Piece, PieceRole, PieceStatus, PieceUpload, now};
pub use freeway_criteria::Criteria;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a piece's file contains, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceType {
    #[display("image")]
    Image,
    #[display("mesh")]
    Mesh,
    #[display("unknown")]
    Unknown,
}

/// Extensions the watcher tracks. Anything else is ignored.
const EXTENSIONS: [(&str, PieceType); 5] = [
    ("png", PieceType::Image),
    ("jpg", PieceType::Image),
    ("jpeg", PieceType::Image),
    ("gif", PieceType::Image),
    ("obj", PieceType::Mesh),
];

impl PieceType {
    /// Look up an extension (without the leading dot), ignoring case.
    pub fn from_extension(extension: &str) -> Option<Self> {
        EXTENSIONS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(extension))
            .map(|(_, kind)| *kind)
    }

    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .unwrap_or(PieceType::Unknown)
    }

    /// Whether the path's extension appears in the extension table.
    pub fn is_known(path: impl AsRef<Path>) -> bool {
        Self::from_path(path) != PieceType::Unknown
    }
}

//! The remote asset service, as seen by the upload orchestrator.

use crate::error::Result;
use async_trait::async_trait;
use derive_more::Display;
use freeway_catalog::PieceType;
use std::path::Path;
use std::sync::Arc;

/// Kind of asset the remote service creates from a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AssetType {
    #[display("Decal")]
    Decal,
    #[display("Mesh")]
    Mesh,
}

impl From<PieceType> for AssetType {
    fn from(kind: PieceType) -> Self {
        match kind {
            PieceType::Mesh => Self::Mesh,
            PieceType::Image | PieceType::Unknown => Self::Decal,
        }
    }
}

/// Identifiers handed back for a newly created asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAsset {
    pub asset_id: String,
    pub decal_id: Option<String>,
    pub operation_id: Option<String>,
}

/// Creates remote assets from local files.
///
/// Implementations report failures through [`ErrorKind::Remote`]; the
/// orchestrator decides whether and when to retry.
///
/// [`ErrorKind::Remote`]: crate::error::ErrorKind::Remote
#[async_trait]
pub trait AssetClient: Send + Sync + 'static {
    async fn create_asset(&self, path: &Path, asset_type: AssetType, name: &str, description: &str)
    -> Result<CreatedAsset>;
}

pub type ClientHandle = Arc<dyn AssetClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PieceType::Image, AssetType::Decal)]
    #[case(PieceType::Mesh, AssetType::Mesh)]
    #[case(PieceType::Unknown, AssetType::Decal)]
    fn test_asset_type(#[case] kind: PieceType, #[case] expected: AssetType) {
        assert_eq!(AssetType::from(kind), expected);
    }
}

//! Collaborators used when no remote asset service is configured.

use async_trait::async_trait;
use freeway_library::error::Result;
use freeway_library::{AssetClient, AssetType, CreatedAsset, NotificationSink};
use serde_json::Value;
use std::path::Path;

/// Asset client that never talks to a remote service.
///
/// Every request is logged and answered with identifiers derived from the
/// request, so the same content always maps to the same fake asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunClient;

#[async_trait]
impl AssetClient for DryRunClient {
    async fn create_asset(
        &self,
        path: &Path,
        asset_type: AssetType,
        name: &str,
        description: &str,
    ) -> Result<CreatedAsset> {
        tracing::info!(path = %path.display(), %asset_type, name, "Skipping asset creation during dry-run mode");
        let digest = blake3::hash(format!("{asset_type}:{description}").as_bytes()).to_hex();
        let short = &digest.as_str()[..16];
        Ok(CreatedAsset {
            asset_id: format!("dry-{short}"),
            decal_id: (asset_type == AssetType::Decal).then(|| format!("dry-decal-{short}")),
            operation_id: None,
        })
    }
}

/// Logs every domain event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn emit(&self, event: &str, payload: Value) {
        let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
        let status = payload.get("status").and_then(Value::as_str).unwrap_or_default();
        tracing::info!(event, name, status, "Piece event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_ids_follow_content() {
        let client = DryRunClient;
        let path = Path::new("/pieces/logo.png");
        let first = client.create_asset(path, AssetType::Decal, "Piece #AB12", "hash:one").await.unwrap();
        let again = client.create_asset(path, AssetType::Decal, "Piece #AB12", "hash:one").await.unwrap();
        let other = client.create_asset(path, AssetType::Decal, "Piece #AB12", "hash:two").await.unwrap();
        assert_eq!(first, again);
        assert_ne!(first.asset_id, other.asset_id);
        assert!(first.asset_id.starts_with("dry-"));
        assert!(first.decal_id.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_mesh_has_no_decal() {
        let created = DryRunClient
            .create_asset(Path::new("/pieces/model.obj"), AssetType::Mesh, "Piece #CD34", "hash:one")
            .await
            .unwrap();
        assert!(created.decal_id.is_none());
    }
}

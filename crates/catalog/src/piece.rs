use crate::kind::PieceType;
use derive_more::Display;
use freeway_criteria::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Current time as epoch seconds.
pub fn now() -> i64 {
    time::UtcDateTime::now().unix_timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceRole {
    /// Backed by a file the user placed in the watch directory.
    #[display("asset")]
    Asset,
    /// Created through the catalog; content not yet written to disk.
    #[display("virtual")]
    Virtual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceStatus {
    #[default]
    #[display("ok")]
    Ok,
    #[display("queue")]
    Queue,
    #[display("upload")]
    Upload,
    #[display("error")]
    Error,
}

/// One successful publish of a piece's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceUpload {
    /// Content hash at publish time.
    pub hash: String,
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

/// A tracked file and everything the catalog knows about it.
///
/// Serialized in camelCase as one element of the metadata document. `isDirty`
/// only exists in memory; loaded pieces are never dirty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Piece {
    pub id: String,
    pub role: PieceRole,
    #[serde(rename = "type")]
    pub kind: PieceType,
    #[serde(default)]
    pub status: PieceStatus,
    pub dir: PathBuf,
    pub name: String,
    /// Empty until the file is first hashed.
    #[serde(default)]
    pub hash: String,
    /// Append-only.
    #[serde(default)]
    pub uploads: Vec<PieceUpload>,
    #[serde(default)]
    pub is_auto_upload: bool,
    #[serde(default = "now")]
    pub updated_at: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub uploaded_at: Option<i64>,
    #[serde(skip)]
    pub is_dirty: bool,
}

impl Piece {
    /// A fresh, dirty piece with no hash yet.
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>, name: impl Into<String>, role: PieceRole) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            role,
            kind: PieceType::from_path(&name),
            status: PieceStatus::Ok,
            dir: dir.into(),
            name,
            hash: String::new(),
            uploads: Vec::new(),
            is_auto_upload: false,
            updated_at: now(),
            deleted_at: None,
            uploaded_at: None,
            is_dirty: true,
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn is_at(&self, dir: &Path, name: &str) -> bool {
        self.dir == dir && self.name == name
    }

    /// The upload matching the current content, if it was published.
    pub fn current_upload(&self) -> Option<&PieceUpload> {
        if self.hash.is_empty() {
            return None;
        }
        self.uploads.iter().find(|upload| upload.hash == self.hash)
    }

    pub fn is_uploaded(&self) -> bool {
        self.current_upload().is_some()
    }
}

impl Record for Piece {
    fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        let value = match name {
            "id" => Value::from(self.id.as_str()),
            "role" => Value::from(self.role.to_string()),
            "type" => Value::from(self.kind.to_string()),
            "status" => Value::from(self.status.to_string()),
            "dir" => Value::from(self.dir.to_string_lossy()),
            "name" => Value::from(self.name.as_str()),
            "fullPath" => Value::from(self.full_path().to_string_lossy()),
            "hash" => Value::from(self.hash.as_str()),
            "isAutoUpload" => Value::from(self.is_auto_upload),
            "isDirty" => Value::from(self.is_dirty),
            "updatedAt" => Value::from(self.updated_at),
            "deletedAt" => self.deleted_at.map_or(Value::Null, Value::from),
            "uploadedAt" => self.uploaded_at.map_or(Value::Null, Value::from),
            other => self.as_value().get(other).cloned()?,
        };
        Some(Cow::Owned(value))
    }

    fn as_value(&self) -> Cow<'_, Value> {
        Cow::Owned(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

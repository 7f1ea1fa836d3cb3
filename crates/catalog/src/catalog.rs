use crate::error::{ErrorKind, Result};
use crate::hash::hash_file;
use crate::piece::{Piece, PieceRole, now};
use exn::{OptionExt, ResultExt};
use freeway_criteria::{Criteria, filter, find};
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::fs;

const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ID_MIN_LENGTH: usize = 4;

/// Defaults applied to pieces the catalog creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogOptions {
    pub is_auto_upload: bool,
}

struct State {
    pieces: Vec<Piece>,
    /// Ids removed during this process; never handed out again.
    retired: HashSet<String>,
}

impl State {
    fn is_taken(&self, id: &str) -> bool {
        self.retired.contains(id) || self.pieces.iter().any(|piece| piece.id == id)
    }

    /// Every ten collisions the id grows by one character.
    fn generate_id(&self) -> String {
        let mut rng = rand::rng();
        let mut attempt = 0;
        loop {
            let length = ID_MIN_LENGTH + attempt / 10;
            let id: String =
                (0..length).map(|_| char::from(ID_CHARSET[rng.random_range(0..ID_CHARSET.len())])).collect();
            if !self.is_taken(&id) {
                return id;
            }
            attempt += 1;
        }
    }

    fn occupied(&self, dir: &Path, name: &str) -> bool {
        self.pieces.iter().any(|piece| piece.is_at(dir, name))
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.pieces.iter().position(|piece| piece.id == id).ok_or_raise(|| ErrorKind::PieceNotFound(id.to_string()))
    }
}

/// Authoritative list of pieces, persisted as a JSON array.
///
/// Reads hand out clones, so no caller ever holds a reference into the list
/// across an await. Mutations that need file I/O do the I/O first and then
/// re-check the list before writing to it.
pub struct Catalog {
    path: PathBuf,
    options: CatalogOptions,
    state: Mutex<State>,
    /// Serializes document writes so a stale snapshot never lands last.
    writer: tokio::sync::Mutex<()>,
}

impl Catalog {
    /// An empty catalog backed by the document at `path`. Nothing is read
    /// until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>, options: CatalogOptions) -> Self {
        Self {
            path: path.into(),
            options,
            state: Mutex::new(State { pieces: Vec::new(), retired: HashSet::new() }),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Create and load in one go.
    pub async fn open(path: impl Into<PathBuf>, options: CatalogOptions) -> Result<Self> {
        let catalog = Self::new(path, options);
        catalog.load().await?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> CatalogOptions {
        self.options
    }

    /// Read the metadata document, replacing the in-memory list.
    ///
    /// A missing document is created empty and an empty file counts as an
    /// empty list. Anything that isn't a JSON array of pieces is refused.
    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<usize> {
        let pieces = match fs::read_to_string(&self.path).await {
            Ok(content) => parse_document(&self.path, &content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Metadata document missing, creating an empty one");
                let _writer = self.writer.lock().await;
                self.write_document(b"[]").await?;
                Vec::new()
            },
            Err(err) => exn::bail!(ErrorKind::io(err, &self.path)),
        };
        let count = pieces.len();
        self.state().pieces = pieces;
        tracing::info!(count, "Catalog loaded");
        Ok(count)
    }

    /// Write the full list to the metadata document, pretty-printed.
    ///
    /// The document is replaced through a rename, so a reader never observes a
    /// partially written file.
    pub async fn save(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let snapshot = self.state().pieces.clone();
        let json = serde_json::to_string_pretty(&snapshot).or_raise(|| ErrorKind::Serialize)?;
        self.write_document(json.as_bytes()).await?;
        tracing::debug!(path = %self.path.display(), count = snapshot.len(), "Catalog saved");
        Ok(())
    }

    pub fn all(&self) -> Vec<Piece> {
        self.state().pieces.clone()
    }

    pub fn len(&self) -> usize {
        self.state().pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().pieces.is_empty()
    }

    pub fn find_one(&self, criteria: &Criteria) -> Option<Piece> {
        find(&self.state().pieces, criteria).cloned()
    }

    pub fn find_many(&self, criteria: &Criteria) -> Vec<Piece> {
        filter(&self.state().pieces, criteria).into_iter().cloned().collect()
    }

    /// The piece tracking `dir/name`, if any.
    pub fn find_at(&self, dir: impl AsRef<Path>, name: &str) -> Option<Piece> {
        self.find_one(&Criteria::eq("dir", dir.as_ref().to_string_lossy()).and_eq("name", name))
    }

    pub fn get(&self, id: &str) -> Result<Piece> {
        let state = self.state();
        let index = state.position(id)?;
        Ok(state.pieces[index].clone())
    }

    /// Apply `change` to the piece with `id` and return the result.
    pub fn update(&self, id: &str, change: impl FnOnce(&mut Piece)) -> Result<Piece> {
        let mut state = self.state();
        let index = state.position(id)?;
        let piece = &mut state.pieces[index];
        change(piece);
        Ok(piece.clone())
    }

    pub fn set_auto_upload(&self, id: &str, enabled: bool) -> Result<Piece> {
        self.update(id, |piece| piece.is_auto_upload = enabled)
    }

    /// Track an existing file: fresh id, initial hash, type from extension.
    #[tracing::instrument(skip(self, dir), fields(dir = %dir.as_ref().display()))]
    pub async fn create_from_file(&self, dir: impl AsRef<Path>, name: &str, role: PieceRole) -> Result<Piece> {
        let dir = dir.as_ref();
        let hash = hash_file(dir.join(name)).await?;

        let mut state = self.state();
        if state.occupied(dir, name) {
            exn::bail!(ErrorKind::AlreadyExists(dir.join(name)));
        }
        let mut piece = Piece::new(state.generate_id(), dir, name, role);
        piece.hash = hash;
        piece.is_dirty = false;
        piece.is_auto_upload = self.options.is_auto_upload;
        state.pieces.push(piece.clone());
        tracing::debug!(id = %piece.id, kind = %piece.kind, "Piece created");
        Ok(piece)
    }

    /// Reconcile a piece with its file on disk.
    ///
    /// Clears the dirty flag and any delete marker, and promotes a virtual
    /// piece now backed by a file to an asset. `hash` and `updatedAt` only
    /// change when the content (or the dirty/delete state) did.
    pub async fn update_from_file(&self, id: &str) -> Result<Piece> {
        let path = self.get(id)?.full_path();
        let hash = hash_file(&path).await?;
        self.update(id, |piece| {
            let mut touched = piece.is_dirty || piece.deleted_at.is_some();
            piece.is_dirty = false;
            piece.deleted_at = None;
            if piece.role == PieceRole::Virtual {
                piece.role = PieceRole::Asset;
            }
            if piece.hash != hash {
                piece.hash = hash;
                touched = true;
            }
            if touched {
                piece.updated_at = now();
            }
        })
    }

    /// Unlink the piece's file and drop it from the catalog. A file that is
    /// already gone is not an error.
    pub async fn delete(&self, id: &str) -> Result<Piece> {
        let path = self.get(id)?.full_path();
        match fs::remove_file(&path).await {
            Ok(()) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "File already absent");
            },
            Err(err) => exn::bail!(ErrorKind::io(err, &path)),
        }
        self.hard_delete(id)
    }

    /// Drop the piece from the catalog without touching the filesystem.
    pub fn hard_delete(&self, id: &str) -> Result<Piece> {
        let mut state = self.state();
        let index = state.position(id)?;
        let piece = state.pieces.remove(index);
        state.retired.insert(piece.id.clone());
        tracing::debug!(id = %piece.id, "Piece removed from catalog");
        Ok(piece)
    }

    /// Register a piece for content the application supplies, then write that
    /// content into place. The entry stays dirty until the file is reconciled;
    /// if the write fails the entry is rolled back.
    pub async fn create_virtual(&self, dir: impl AsRef<Path>, name: &str, content: impl AsRef<[u8]>) -> Result<Piece> {
        let dir = dir.as_ref();
        let piece = {
            let mut state = self.state();
            if state.occupied(dir, name) {
                exn::bail!(ErrorKind::AlreadyExists(dir.join(name)));
            }
            let mut piece = Piece::new(state.generate_id(), dir, name, PieceRole::Virtual);
            piece.is_auto_upload = self.options.is_auto_upload;
            state.pieces.push(piece.clone());
            piece
        };

        let path = piece.full_path();
        if let Err(err) = write_file(&path, content.as_ref()).await {
            tracing::warn!(id = %piece.id, path = %path.display(), "Content write failed, rolling back virtual piece");
            if let Err(rollback) = self.hard_delete(&piece.id) {
                tracing::warn!(id = %piece.id, error = ?rollback, "Virtual piece vanished before rollback");
            }
            return Err(err);
        }
        Ok(piece)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold `self.writer`.
    async fn write_document(&self, bytes: &[u8]) -> Result<()> {
        let mut temporary = self.path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);
        write_file(&temporary, bytes).await?;
        fs::rename(&temporary, &self.path).await.map_err(|e| ErrorKind::io(e, &self.path))?;
        Ok(())
    }
}

fn parse_document(path: &Path, content: &str) -> Result<Vec<Piece>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(content).or_raise(|| ErrorKind::Malformed(path.to_path_buf()))?;
    if !value.is_array() {
        exn::bail!(ErrorKind::Malformed(path.to_path_buf()));
    }
    serde_json::from_value(value).or_raise(|| ErrorKind::Malformed(path.to_path_buf()))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| ErrorKind::io(e, parent))?;
    }
    fs::write(path, bytes).await.map_err(|e| ErrorKind::io(e, path))?;
    Ok(())
}

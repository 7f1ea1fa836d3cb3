//! A directory of `<id>-<hash><ext>` links, one per version of every clean
//! piece, so other tools can reference exact content by file name.

use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventBus, PieceEvent};
use freeway_catalog::{Catalog, Piece};
use futures::{StreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::task::JoinHandle;

/// Filesystem operations in flight during a full reconciliation.
const CONCURRENCY: usize = 5;

fn link_error(err: io::Error, path: &Path) -> Error {
    exn::Exn::from(err).raise(ErrorKind::Link(path.to_path_buf()))
}

/// `<id>-<hash><ext>`, or `None` while the piece has no settled content.
pub fn link_name(piece: &Piece) -> Option<String> {
    if piece.is_dirty || piece.hash.is_empty() || piece.deleted_at.is_some() {
        return None;
    }
    let extension = Path::new(&piece.name)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| format!(".{extension}"))
        .unwrap_or_default();
    Some(format!("{}-{}{}", piece.id, piece.hash, extension))
}

#[cfg(unix)]
async fn create_link(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

// Symlinks need elevated rights on Windows; hard links don't.
#[cfg(not(unix))]
async fn create_link(target: &Path, link: &Path) -> io::Result<()> {
    fs::hard_link(target, link).await
}

async fn remove(link: &Path) -> Result<()> {
    match fs::remove_file(link).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(link_error(err, link)),
    }
}

/// What a full reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Maintains the links directory for a catalog.
#[derive(Clone)]
pub struct Links {
    dir: PathBuf,
    catalog: Arc<Catalog>,
}

impl Links {
    pub fn new(dir: impl Into<PathBuf>, catalog: Arc<Catalog>) -> Self {
        Self { dir: dir.into(), catalog }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Link the piece's current content and drop links to its older content.
    ///
    /// Returns the link, or `None` for a piece without settled content.
    pub async fn ensure_link(&self, piece: &Piece) -> Result<Option<PathBuf>> {
        let Some(name) = link_name(piece) else {
            return Ok(None);
        };
        fs::create_dir_all(&self.dir).await.map_err(|err| link_error(err, &self.dir))?;
        let link = self.dir.join(&name);
        if fs::symlink_metadata(&link).await.is_err() {
            match create_link(&piece.full_path(), &link).await {
                Ok(()) => tracing::debug!(id = %piece.id, link = %link.display(), "Link created"),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {},
                Err(err) => return Err(link_error(err, &link)),
            }
        }
        self.remove_matching(&piece.id, Some(&name)).await?;
        Ok(Some(link))
    }

    /// Remove every link to the piece, returning how many there were.
    pub async fn remove_link(&self, piece: &Piece) -> Result<usize> {
        self.remove_matching(&piece.id, None).await
    }

    async fn remove_matching(&self, id: &str, keep: Option<&str>) -> Result<usize> {
        // Ids never contain a dash, so the prefix can't match another piece.
        let prefix = format!("{id}-");
        let mut removed = 0;
        for name in self.existing().await? {
            if name.starts_with(&prefix) && Some(name.as_str()) != keep {
                remove(&self.dir.join(&name)).await?;
                tracing::debug!(id, link = %name, "Link removed");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Entry names in the links directory; none if it doesn't exist yet.
    async fn existing(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(link_error(err, &self.dir)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| link_error(err, &self.dir))? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Make the directory match the catalog: remove links no clean piece
    /// accounts for, then create the missing ones.
    ///
    /// Individual failures are counted in the report rather than aborting.
    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn sync_links(&self) -> Result<SyncReport> {
        fs::create_dir_all(&self.dir).await.map_err(|err| link_error(err, &self.dir))?;
        let wanted: HashMap<String, PathBuf> = self
            .catalog
            .all()
            .into_iter()
            .filter_map(|piece| Some((link_name(&piece)?, piece.full_path())))
            .collect();
        let existing: HashSet<String> = self.existing().await?.into_iter().collect();

        let stale: Vec<PathBuf> =
            existing.iter().filter(|name| !wanted.contains_key(*name)).map(|name| self.dir.join(name)).collect();
        let missing: Vec<(PathBuf, PathBuf)> = wanted
            .iter()
            .filter(|(name, _)| !existing.contains(*name))
            .map(|(name, target)| (target.clone(), self.dir.join(name)))
            .collect();

        let removals: Vec<Result<()>> = stream::iter(stale)
            .map(|link| async move { remove(&link).await })
            .buffer_unordered(CONCURRENCY)
            .collect()
            .await;
        let creations: Vec<Result<()>> = stream::iter(missing)
            .map(|(target, link)| async move {
                create_link(&target, &link).await.map_err(|err| link_error(err, &link))
            })
            .buffer_unordered(CONCURRENCY)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for result in removals {
            match result {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(error = ?err, "Could not remove stale link");
                },
            }
        }
        for result in creations {
            match result {
                Ok(()) => report.created += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(error = ?err, "Could not create link");
                },
            }
        }
        tracing::info!(created = report.created, removed = report.removed, failed = report.failed, "Links synchronized");
        Ok(report)
    }

    /// Keep links current as pieces change, and reconcile the whole directory
    /// once the watcher is ready.
    pub fn spawn(&self, events: &EventBus) -> JoinHandle<()> {
        let mut receiver = events.subscribe();
        let links = self.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(err) = links.on_event(&event).await {
                    tracing::warn!(event = event.name(), error = ?err, "Could not maintain links");
                }
            }
        })
    }

    async fn on_event(&self, event: &PieceEvent) -> Result<()> {
        match event {
            PieceEvent::Created(piece) | PieceEvent::Changed(piece) => {
                self.ensure_link(piece).await?;
            },
            PieceEvent::Deleted(piece) => {
                self.remove_link(piece).await?;
            },
            PieceEvent::WatcherReady => {
                self.sync_links().await?;
            },
            // The initial scan is covered by the reconciliation on ready.
            PieceEvent::Initiated(_) => {},
            PieceEvent::Updated(_) | PieceEvent::Uploaded(_) | PieceEvent::EnabledAutoUpload(_) => {},
        }
        Ok(())
    }
}

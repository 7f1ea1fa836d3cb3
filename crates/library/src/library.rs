use crate::client::ClientHandle;
use crate::error::{ErrorKind, Result};
use crate::events::{EventBus, NotificationSink, PieceEvent, forward};
use crate::links::Links;
use crate::persist::save_on_idle;
use crate::upload::Uploader;
use crate::watch::Watcher;
use freeway_catalog::{Catalog, CatalogOptions, Piece};
use freeway_config::{Config, QueueConfig};
use freeway_criteria::Criteria;
use freeway_queue::Options;
use std::sync::Arc;
use tokio::task::JoinHandle;

fn queue_options(config: &QueueConfig) -> Options {
    Options::new(config.delay(), config.concurrency, config.retries)
}

/// A running piece library: catalog, watcher, upload orchestrator and link
/// maintenance wired to one event bus.
pub struct Library {
    catalog: Arc<Catalog>,
    events: EventBus,
    uploader: Uploader,
    watcher: Watcher,
    tasks: Vec<JoinHandle<()>>,
}

impl Library {
    /// Load the catalog, then start auto-upload and the watcher.
    ///
    /// A malformed metadata document aborts startup.
    #[tracing::instrument(skip_all, fields(root = %config.watch_directory.display()))]
    pub async fn start(
        config: &Config,
        client: ClientHandle,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self> {
        let options = CatalogOptions { is_auto_upload: config.auto_upload };
        let catalog = Arc::new(Catalog::open(config.metadata_path.clone(), options).await.map_err(ErrorKind::catalog)?);
        tracing::info!(path = %catalog.path().display(), pieces = catalog.len(), "Catalog loaded");

        let events = EventBus::default();
        let mut tasks = Vec::new();
        if let Some(sink) = sink {
            tasks.push(forward(&events, sink));
        }

        let uploader =
            Uploader::new(Arc::clone(&catalog), client, events.clone(), queue_options(&config.upload_queue));
        tasks.push(uploader.spawn_auto_upload());
        tasks.push(save_on_idle(Arc::clone(&catalog), uploader.subscribe_idle()));
        if let Some(dir) = &config.links_directory {
            tasks.push(Links::new(dir, Arc::clone(&catalog)).spawn(&events));
        }

        let watcher = Watcher::new(
            &config.watch_directory,
            Arc::clone(&catalog),
            events.clone(),
            queue_options(&config.watcher_queue),
        )?;
        watcher.start()?;
        watcher.bootstrapped();

        Ok(Self { catalog, events, uploader, watcher, tasks })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// Wait for the initial scan to finish.
    pub async fn ready(&self) {
        self.watcher.ready().await;
    }

    pub fn get(&self, id: &str) -> Result<Piece> {
        self.catalog.get(id).map_err(ErrorKind::catalog)
    }

    pub fn find(&self, criteria: &Criteria) -> Vec<Piece> {
        self.catalog.find_many(criteria)
    }

    /// Enabling auto-upload also uploads the current content.
    pub async fn set_auto_upload(&self, id: &str, enabled: bool) -> Result<Piece> {
        let piece = self.catalog.set_auto_upload(id, enabled).map_err(ErrorKind::catalog)?;
        self.events.emit(PieceEvent::Updated(piece.clone()));
        if enabled {
            self.events.emit(PieceEvent::EnabledAutoUpload(piece.clone()));
        }
        self.save().await?;
        Ok(piece)
    }

    /// Add a piece with application-supplied content at `name` in the watch
    /// directory. It stays virtual until the watcher sees the file.
    pub async fn create_piece(&self, name: &str, content: impl AsRef<[u8]>) -> Result<Piece> {
        let piece =
            self.catalog.create_virtual(self.watcher.root(), name, content).await.map_err(ErrorKind::catalog)?;
        self.events.emit(PieceEvent::Created(piece.clone()));
        self.save().await?;
        Ok(piece)
    }

    /// Delete the piece's file and its catalog entry.
    pub async fn delete_piece(&self, id: &str) -> Result<Piece> {
        let piece = self.catalog.delete(id).await.map_err(ErrorKind::catalog)?;
        tracing::info!(id, name = %piece.name, "Piece deleted");
        self.events.emit(PieceEvent::Deleted(piece.clone()));
        self.save().await?;
        Ok(piece)
    }

    /// Upload now, bypassing the upload queue.
    pub async fn upload(&self, id: &str) -> Result<Piece> {
        let piece = self.uploader.upload_asset(id).await?;
        self.save().await?;
        Ok(piece)
    }

    pub async fn save(&self) -> Result<()> {
        self.catalog.save().await.map_err(ErrorKind::catalog)
    }

    /// Stop watching, stop background tasks and flush the catalog.
    pub async fn shutdown(self) -> Result<()> {
        self.watcher.stop().await?;
        for task in &self.tasks {
            task.abort();
        }
        self.save().await
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockClient, RecordingSink, eventually, wait_for};
    use freeway_catalog::{PieceRole, PieceStatus, PieceType};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &Path, auto_upload: bool) -> Config {
        let queue = QueueConfig { delay_ms: 50, concurrency: 4, retries: 1 };
        Config {
            watch_directory: dir.join("files"),
            metadata_path: dir.join("metadata.json"),
            auto_upload,
            links_directory: None,
            watcher_queue: queue,
            upload_queue: queue,
        }
    }

    /// Write outside the watch directory, then move into place, so the watcher
    /// never sees a half-written file.
    fn place(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let staging = dir.path().join("staging.tmp");
        std::fs::write(&staging, content).unwrap();
        let target = dir.path().join("files").join(name);
        std::fs::rename(&staging, &target).unwrap();
        target
    }

    async fn start(dir: &TempDir, auto_upload: bool, client: Arc<MockClient>) -> (Library, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let notify: Arc<dyn NotificationSink> = sink.clone();
        let library = Library::start(&config(dir.path(), auto_upload), client, Some(notify)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), library.ready()).await.unwrap();
        (library, sink)
    }

    #[tokio::test]
    async fn test_dropped_file_is_created_then_changed() {
        let dir = tempfile::tempdir().unwrap();
        let (library, sink) = start(&dir, false, Arc::new(MockClient::default())).await;
        let mut events = library.events().subscribe();

        place(&dir, "logo.png", b"first");
        let PieceEvent::Created(created) = wait_for(&mut events, |event| matches!(event, PieceEvent::Created(_))).await
        else {
            unreachable!()
        };
        assert_eq!(library.catalog().len(), 1);
        assert_eq!(created.name, "logo.png");
        assert_eq!(created.kind, PieceType::Image);
        assert_eq!(created.role, PieceRole::Asset);
        assert!(!created.hash.is_empty());

        place(&dir, "logo.png", b"second");
        let PieceEvent::Changed(changed) = wait_for(&mut events, |event| matches!(event, PieceEvent::Changed(_))).await
        else {
            unreachable!()
        };
        assert_eq!(changed.id, created.id);
        assert_ne!(changed.hash, created.hash);

        eventually(|| sink.names().iter().any(|name| name == "piece.changed")).await;
        let names = sink.names();
        assert_eq!(names[0], "piece.watcher.ready");
        assert!(names.contains(&"piece.created".to_string()));

        // Saved once the watcher queue went idle.
        let metadata = dir.path().join("metadata.json");
        eventually(|| std::fs::read_to_string(&metadata).is_ok_and(|document| document.contains(&changed.hash))).await;
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_upload_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::default());
        let (library, _sink) = start(&dir, true, Arc::clone(&client)).await;
        let mut events = library.events().subscribe();

        place(&dir, "logo.png", b"content");
        let mut statuses = Vec::new();
        let uploaded = loop {
            match wait_for(&mut events, |event| matches!(event, PieceEvent::Updated(_) | PieceEvent::Uploaded(_))).await
            {
                PieceEvent::Updated(piece) => statuses.push(piece.status),
                PieceEvent::Uploaded(piece) => break piece,
                _ => unreachable!(),
            }
        };
        assert!(statuses.windows(3).any(|window| window == [PieceStatus::Queue, PieceStatus::Upload, PieceStatus::Ok]));
        assert_eq!(uploaded.uploads.len(), 1);

        library.uploader().settled().await;
        let piece = library.get(&uploaded.id).unwrap();
        assert_eq!(piece.status, PieceStatus::Ok);
        assert_eq!(piece.uploads.len(), 1);
        assert_eq!(client.calls().len(), 1);
        library.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_large_initial_scan_uploads_every_piece() {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir_all(&files).unwrap();
        for index in 0..1_000 {
            std::fs::write(files.join(format!("piece-{index:04}.png")), index.to_string()).unwrap();
        }
        let client = Arc::new(MockClient::default());
        let (library, sink) = start(&dir, true, Arc::clone(&client)).await;
        assert_eq!(library.catalog().len(), 1_000);

        eventually(|| library.catalog().all().iter().all(|piece| piece.is_uploaded())).await;
        library.uploader().settled().await;
        assert_eq!(client.calls().len(), 1_000);
        eventually(|| sink.names().iter().filter(|name| *name == "piece.uploaded").count() == 1_000).await;
        assert_eq!(sink.names().iter().filter(|name| *name == "piece.initiated").count(), 1_000);
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_upload_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::failing(u32::MAX));
        let (library, _sink) = start(&dir, true, Arc::clone(&client)).await;
        let mut events = library.events().subscribe();

        place(&dir, "logo.png", b"content");
        let PieceEvent::Updated(failed) = wait_for(
            &mut events,
            |event| matches!(event, PieceEvent::Updated(piece) if piece.status == PieceStatus::Error),
        )
        .await
        else {
            unreachable!()
        };
        assert!(failed.uploads.is_empty());
        assert!(failed.uploaded_at.is_none());
        // One attempt plus one retry.
        assert_eq!(client.calls().len(), 2);
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enabling_auto_upload_uploads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/model.obj"), b"v 0 0 0").unwrap();
        let client = Arc::new(MockClient::default());
        let (library, sink) = start(&dir, false, Arc::clone(&client)).await;
        let mut events = library.events().subscribe();

        let piece = library.catalog().all().pop().unwrap();
        assert!(!piece.is_auto_upload);
        library.set_auto_upload(&piece.id, true).await.unwrap();

        wait_for(&mut events, |event| matches!(event, PieceEvent::Uploaded(_))).await;
        assert_eq!(client.calls()[0].asset_type, crate::AssetType::Mesh);
        eventually(|| sink.names().iter().any(|name| name == "piece.enabled-auto-upload")).await;
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_and_delete_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (library, _sink) = start(&dir, false, Arc::new(MockClient::default())).await;
        let mut events = library.events().subscribe();

        let created = library.create_piece("made.png", b"pixels").await.unwrap();
        assert_eq!(created.role, PieceRole::Virtual);
        assert!(dir.path().join("files/made.png").exists());

        let promoted = wait_for(
            &mut events,
            |event| matches!(event, PieceEvent::Changed(piece) if piece.id == created.id),
        )
        .await;
        assert_eq!(promoted.piece().unwrap().role, PieceRole::Asset);

        let deleted = library.delete_piece(&created.id).await.unwrap();
        assert_eq!(deleted.id, created.id);
        assert!(!dir.path().join("files/made.png").exists());
        assert!(library.catalog().is_empty());
        let err = library.get(&created.id).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_links_follow_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/logo.png"), b"logo").unwrap();
        let links = dir.path().join("links");
        let config = Config { links_directory: Some(links.clone()), ..config(dir.path(), false) };
        let library = Library::start(&config, Arc::new(MockClient::default()), None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), library.ready()).await.unwrap();
        let listing = || -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&links)
                .map(|entries| entries.map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned()).collect())
                .unwrap_or_default();
            names.sort();
            names
        };

        let logo = library.catalog().all().pop().unwrap();
        let expected = vec![crate::link_name(&logo).unwrap()];
        eventually(|| listing() == expected).await;
        assert_eq!(std::fs::read(links.join(&expected[0])).unwrap(), b"logo");

        library.delete_piece(&logo.id).await.unwrap();
        eventually(|| listing().is_empty()).await;
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_find() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/logo.png"), b"logo").unwrap();
        std::fs::write(dir.path().join("files/model.obj"), b"v 0 0 0").unwrap();
        let (library, _sink) = start(&dir, false, Arc::new(MockClient::default())).await;

        let meshes = library.find(&r#"{"type": "mesh"}"#.parse().unwrap());
        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes[0].name, "model.obj");
        library.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_catalog_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metadata.json"), b"{\"not\": \"an array\"}").unwrap();
        let result = Library::start(&config(dir.path(), false), Arc::new(MockClient::default()), None).await;
        let err = result.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Catalog));
    }

    #[tokio::test]
    async fn test_shutdown_saves_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let (library, _sink) = start(&dir, false, Arc::new(MockClient::default())).await;
        let piece = library.create_piece("made.png", b"pixels").await.unwrap();
        library.shutdown().await.unwrap();

        let document = std::fs::read_to_string(dir.path().join("metadata.json")).unwrap();
        assert!(document.contains(&piece.id));
    }
}

//! Publishing pieces to the remote asset service.

use crate::client::{AssetType, ClientHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventBus, PieceEvent};
use exn::ResultExt;
use freeway_catalog::{Catalog, Piece, PieceStatus, PieceUpload, now};
use freeway_queue::{Builder, Latest, OperationQueue, Options, Status, Ticket};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type UploadQueue = OperationQueue<PathBuf, String, Piece, Error>;

struct Context {
    catalog: Arc<Catalog>,
    client: ClientHandle,
    events: EventBus,
}

impl Context {
    fn set_status(&self, id: &str, status: PieceStatus) -> Result<Piece> {
        let piece = self.catalog.update(id, |piece| piece.status = status).map_err(ErrorKind::catalog)?;
        self.events.emit(PieceEvent::Updated(piece.clone()));
        Ok(piece)
    }

    /// The upload job: create the asset and record it against the hash that
    /// was current when the job started.
    #[tracing::instrument(skip(self))]
    async fn publish(&self, id: &str) -> Result<Piece> {
        let piece = self.catalog.get(id).map_err(ErrorKind::catalog)?;
        if piece.is_uploaded() {
            tracing::debug!("Current content already uploaded");
            return self.set_status(id, PieceStatus::Ok);
        }

        let piece = self.set_status(id, PieceStatus::Upload)?;
        let hash = piece.hash.clone();
        let created = self
            .client
            .create_asset(
                &piece.full_path(),
                AssetType::from(piece.kind),
                &format!("Piece #{}", piece.id),
                &format!("hash:{hash}"),
            )
            .await
            .or_raise(|| ErrorKind::Upload)?;

        // Another job may have recorded this hash while the request was out.
        let piece = self
            .catalog
            .update(id, |piece| {
                if !piece.uploads.iter().any(|upload| upload.hash == hash) {
                    piece.uploads.push(PieceUpload {
                        hash: hash.clone(),
                        asset_id: created.asset_id.clone(),
                        decal_id: created.decal_id.clone(),
                        operation_id: created.operation_id.clone(),
                    });
                }
                piece.uploaded_at = Some(now());
                piece.status = PieceStatus::Ok;
            })
            .map_err(ErrorKind::catalog)?;
        tracing::info!(asset_id = %created.asset_id, name = %piece.name, "Piece uploaded");
        self.events.emit(PieceEvent::Updated(piece.clone()));
        self.events.emit(PieceEvent::Uploaded(piece.clone()));
        Ok(piece)
    }

    fn fail(&self, id: &str) {
        if let Err(err) = self.set_status(id, PieceStatus::Error) {
            tracing::warn!(id, error = ?err, "Could not mark failed upload");
        }
    }
}

/// Upload orchestrator.
///
/// Jobs are keyed by the piece's full path, so requests for the same file
/// collapse into one upload. A request arriving while that file is uploading
/// is replayed afterwards and becomes a no-op if nothing changed.
#[derive(Clone)]
pub struct Uploader {
    context: Arc<Context>,
    queue: UploadQueue,
}

impl Uploader {
    pub fn new(catalog: Arc<Catalog>, client: ClientHandle, events: EventBus, options: Options) -> Self {
        let context = Arc::new(Context { catalog, client, events });
        let queue = Builder::new("upload")
            .options(options)
            .merge(Latest)
            .on_rejected({
                let context = Arc::clone(&context);
                move |_path: &PathBuf, id: &String, _err: &Error| context.fail(id)
            })
            .build({
                let context = Arc::clone(&context);
                move |_path: PathBuf, id: String| {
                    let context = Arc::clone(&context);
                    async move { context.publish(&id).await }
                }
            });
        Self { context, queue }
    }

    /// Schedule an upload of the piece's current content.
    ///
    /// Returns `None` without scheduling anything when that content is already
    /// uploaded or hasn't been hashed yet. Failures after the last retry leave
    /// the piece with `status = error`; the ticket carries the rejection.
    pub fn queue_upload_asset(&self, id: &str) -> Result<Option<Ticket<Piece>>> {
        let piece = self.context.catalog.get(id).map_err(ErrorKind::catalog)?;
        if piece.hash.is_empty() {
            tracing::debug!(id, "Piece not hashed yet, nothing to upload");
            return Ok(None);
        }
        if piece.is_uploaded() {
            tracing::debug!(id, "Current content already uploaded");
            return Ok(None);
        }
        let path = piece.full_path();
        // A running upload keeps its status; the replay re-checks the hash.
        if self.queue.status(&path) != Some(Status::Running) {
            self.context.set_status(id, PieceStatus::Queue)?;
        }
        Ok(Some(self.queue.add(path, piece.id)))
    }

    /// Upload right away, bypassing the queue, and return the updated piece.
    ///
    /// A dirty piece is reconciled with its file first.
    #[tracing::instrument(skip(self))]
    pub async fn upload_asset(&self, id: &str) -> Result<Piece> {
        let mut piece = self.context.catalog.get(id).map_err(ErrorKind::catalog)?;
        if piece.is_dirty || piece.hash.is_empty() {
            piece = self.context.catalog.update_from_file(id).await.map_err(ErrorKind::catalog)?;
        }
        if piece.is_uploaded() {
            return Ok(piece);
        }
        match self.context.publish(id).await {
            Ok(piece) => Ok(piece),
            Err(err) => {
                tracing::error!(error = ?err, "Upload failed");
                self.context.fail(id);
                Err(err)
            },
        }
    }

    /// Upload pieces flagged for auto-upload whenever they are initiated,
    /// created, changed or get the flag enabled.
    pub fn spawn_auto_upload(&self) -> JoinHandle<()> {
        let mut receiver = self.context.events.subscribe();
        let uploader = self.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                uploader.on_event(&event);
            }
        })
    }

    fn on_event(&self, event: &PieceEvent) {
        let piece = match event {
            PieceEvent::Initiated(piece)
            | PieceEvent::Created(piece)
            | PieceEvent::Changed(piece)
            | PieceEvent::EnabledAutoUpload(piece) => piece,
            _ => return,
        };
        if !piece.is_auto_upload {
            return;
        }
        match self.queue_upload_asset(&piece.id) {
            Ok(Some(_ticket)) => tracing::debug!(id = %piece.id, event = event.name(), "Auto-upload scheduled"),
            Ok(None) => {},
            Err(err) => tracing::warn!(id = %piece.id, error = ?err, "Could not schedule auto-upload"),
        }
    }

    pub fn subscribe_idle(&self) -> broadcast::Receiver<()> {
        self.queue.subscribe_idle()
    }

    /// Wait until no upload is pending.
    pub async fn settled(&self) {
        self.queue.settled().await;
    }
}

use freeway_catalog::Catalog;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Save the catalog whenever a queue goes idle, batching the writes caused by
/// a burst of operations into one.
pub(crate) fn save_on_idle(catalog: Arc<Catalog>, mut idle: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match idle.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => {
                    if let Err(err) = catalog.save().await {
                        tracing::warn!(path = %catalog.path().display(), error = ?err, "Could not save catalog");
                    }
                },
                Err(RecvError::Closed) => break,
            }
        }
    })
}

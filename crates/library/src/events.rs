//! Domain events and their delivery to a notification sink.

use freeway_catalog::Piece;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum PieceEvent {
    /// Seen by the initial scan.
    Initiated(Piece),
    Created(Piece),
    /// File content was reconciled after a change notification.
    Changed(Piece),
    /// Status or upload bookkeeping changed.
    Updated(Piece),
    Uploaded(Piece),
    Deleted(Piece),
    /// Initial scan drained and the application finished bootstrapping.
    WatcherReady,
    EnabledAutoUpload(Piece),
}

impl PieceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiated(_) => "piece.initiated",
            Self::Created(_) => "piece.created",
            Self::Changed(_) => "piece.changed",
            Self::Updated(_) => "piece.updated",
            Self::Uploaded(_) => "piece.uploaded",
            Self::Deleted(_) => "piece.deleted",
            Self::WatcherReady => "piece.watcher.ready",
            Self::EnabledAutoUpload(_) => "piece.enabled-auto-upload",
        }
    }

    pub fn piece(&self) -> Option<&Piece> {
        match self {
            Self::Initiated(piece)
            | Self::Created(piece)
            | Self::Changed(piece)
            | Self::Updated(piece)
            | Self::Uploaded(piece)
            | Self::Deleted(piece)
            | Self::EnabledAutoUpload(piece) => Some(piece),
            Self::WatcherReady => None,
        }
    }

    /// Wire payload: the serialized piece, or `null`.
    pub fn payload(&self) -> Value {
        match self.piece() {
            Some(piece) => serde_json::to_value(piece).unwrap_or_else(|err| {
                tracing::warn!(id = %piece.id, error = %err, "Could not serialize event payload");
                Value::Null
            }),
            None => Value::Null,
        }
    }
}

/// Multi-producer, multi-consumer channel of [`PieceEvent`]s.
///
/// Every subscriber gets its own unbounded queue, so a slow subscriber falls
/// behind but never misses an event. Emitting without subscribers is fine; the
/// event is dropped. Subscriptions end once every clone of the bus is gone.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<PieceEvent>>>>,
}

impl EventBus {
    pub fn emit(&self, event: PieceEvent) {
        tracing::trace!(event = event.name(), "Emitting event");
        // Held while sending so every subscriber sees the same order.
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| listener.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PieceEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(sender);
        receiver
    }
}

/// Receives every domain event, e.g. to relay it to a UI.
pub trait NotificationSink: Send + Sync + 'static {
    fn emit(&self, event: &str, payload: Value);
}

/// Relay every event on `bus` to `sink` until the bus closes.
pub fn forward(bus: &EventBus, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            sink.emit(event.name(), event.payload());
        }
    })
}

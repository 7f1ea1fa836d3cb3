//! A directory of pieces kept in sync with the catalog and published to a
//! remote asset service.
//!
//! [`Library::start`] wires everything together; the parts are usable on
//! their own for embedding in a different application shell.

mod client;
pub mod error;
mod events;
mod library;
mod links;
mod persist;
mod upload;
mod watch;

#[cfg(test)]
mod testing;

pub use crate::client::{AssetClient, AssetType, ClientHandle, CreatedAsset};
pub use crate::events::{EventBus, NotificationSink, PieceEvent, forward};
pub use crate::library::Library;
pub use crate::links::{Links, SyncReport, link_name};
pub use crate::upload::Uploader;
pub use crate::watch::{Watcher, WatcherState};

//! Collaborator doubles shared by the unit tests.

use crate::client::{AssetClient, AssetType, CreatedAsset};
use crate::error::{ErrorKind, Result};
use crate::events::{NotificationSink, PieceEvent};
use async_trait::async_trait;
use freeway_queue::{Backoff, Options};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub path: PathBuf,
    pub asset_type: AssetType,
    pub name: String,
    pub description: String,
}

/// Records every request; the first `failures` requests fail.
#[derive(Default)]
pub(crate) struct MockClient {
    calls: Mutex<Vec<Call>>,
    failures: u32,
}

impl MockClient {
    pub fn failing(failures: u32) -> Self {
        Self { calls: Mutex::default(), failures }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetClient for MockClient {
    async fn create_asset(
        &self,
        path: &Path,
        asset_type: AssetType,
        name: &str,
        description: &str,
    ) -> Result<CreatedAsset> {
        let number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                path: path.to_path_buf(),
                asset_type,
                name: name.to_string(),
                description: description.to_string(),
            });
            calls.len()
        };
        if (number as u64) <= u64::from(self.failures) {
            exn::bail!(ErrorKind::Remote("service unavailable".to_string()));
        }
        Ok(CreatedAsset {
            asset_id: format!("asset-{number}"),
            decal_id: Some(format!("decal-{number}")),
            operation_id: None,
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|(name, _)| name).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().unwrap().push((event.to_string(), payload));
    }
}

/// Short delays so tests run in real time.
pub(crate) fn fast_options() -> Options {
    Options::new(Duration::from_millis(10), 4, 2).with_backoff(Backoff {
        initial: Duration::from_millis(1),
        factor: 2,
        max: Duration::from_millis(10),
    })
}

pub(crate) async fn next_event(receiver: &mut mpsc::UnboundedReceiver<PieceEvent>) -> PieceEvent {
    tokio::time::timeout(Duration::from_secs(10), receiver.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Skip events until one satisfies `predicate`.
pub(crate) async fn wait_for(
    receiver: &mut mpsc::UnboundedReceiver<PieceEvent>,
    predicate: impl Fn(&PieceEvent) -> bool,
) -> PieceEvent {
    loop {
        let event = next_event(receiver).await;
        if predicate(&event) {
            return event;
        }
    }
}

/// Poll `check` until it holds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

//! Keeps the catalog in step with the watch directory.
//!
//! Every path, whether found by the initial scan or reported by a filesystem
//! notification, goes through one operation queue keyed by its absolute path,
//! so work on the same file never overlaps and bursts of notifications settle
//! into a single reconciliation.

mod filter;
mod scan;

use self::filter::{Task, classify, is_hidden, is_tracked};
use self::scan::walk;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventBus, PieceEvent};
use crate::persist::save_on_idle;
use exn::{OptionExt, ResultExt};
use freeway_catalog::error::ErrorKind as CatalogErrorKind;
use freeway_catalog::{Catalog, Piece, PieceRole};
use freeway_queue::{Builder, Latest, OperationQueue, Options, Ticket};
use futures::StreamExt;
use futures::future::join_all;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

type WatchQueue = OperationQueue<PathBuf, Task, (), Error>;
type Notification = notify::Result<notify::Event>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Initializing,
    Scanning,
    Ready,
}

#[derive(Default)]
struct Readiness {
    scanned: bool,
    bootstrapped: bool,
    announced: bool,
}

struct Shared {
    root: PathBuf,
    catalog: Arc<Catalog>,
    events: EventBus,
    state: watch::Sender<WatcherState>,
    readiness: Mutex<Readiness>,
}

impl Shared {
    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok().filter(|relative| !relative.as_os_str().is_empty())
    }

    /// Announce readiness exactly once, as soon as both the scan and the
    /// application bootstrap are done.
    fn advance(&self, change: impl FnOnce(&mut Readiness)) {
        let announce = {
            let mut readiness = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut readiness);
            let announce = readiness.scanned && readiness.bootstrapped && !readiness.announced;
            readiness.announced |= announce;
            announce
        };
        if announce {
            self.state.send_replace(WatcherState::Ready);
            tracing::info!(root = %self.root.display(), "Watcher ready");
            self.events.emit(PieceEvent::WatcherReady);
        }
    }

    async fn process(&self, path: PathBuf, task: Task) -> Result<()> {
        let Some(name) = self.relative(&path).and_then(Path::to_str) else {
            tracing::debug!(path = %path.display(), "Not a trackable path");
            return Ok(());
        };
        match task {
            Task::Init => self.on_init(name).await,
            Task::Change => self.on_change(name).await,
            Task::Unlink => self.on_unlink(name).await,
        }
    }

    async fn on_init(&self, name: &str) -> Result<()> {
        let (piece, _) = self.reconcile(name).await?;
        self.events.emit(PieceEvent::Initiated(piece));
        Ok(())
    }

    async fn on_change(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                tracing::trace!(path = %path.display(), "Ignoring directory");
                return Ok(());
            },
            Ok(_) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Changed path no longer exists");
                return self.on_unlink(name).await;
            },
            Err(err) => return Err(exn::Exn::from(err).raise(ErrorKind::Read(path))),
        }

        let (piece, created) = self.reconcile(name).await?;
        tracing::debug!(id = %piece.id, name, created, "Piece reconciled");
        self.events.emit(if created { PieceEvent::Created(piece) } else { PieceEvent::Changed(piece) });
        Ok(())
    }

    async fn on_unlink(&self, name: &str) -> Result<()> {
        if let Some(piece) = self.catalog.find_at(&self.root, name) {
            self.remove(&piece)?;
            return Ok(());
        }

        // A directory going away takes the pieces inside it along.
        let prefix = self.root.join(name);
        if fs::try_exists(&prefix).await.unwrap_or(false) {
            return Ok(());
        }
        let orphans = self
            .catalog
            .all()
            .into_iter()
            .filter(|piece| piece.dir == self.root && piece.full_path().starts_with(&prefix));
        for piece in orphans {
            self.remove(&piece)?;
        }
        Ok(())
    }

    fn remove(&self, piece: &Piece) -> Result<()> {
        let piece = self.catalog.hard_delete(&piece.id).map_err(ErrorKind::catalog)?;
        tracing::debug!(id = %piece.id, name = %piece.name, "Piece deleted");
        self.events.emit(PieceEvent::Deleted(piece));
        Ok(())
    }

    /// Find-or-create the piece at `name` and bring it in line with its file.
    /// The flag is `true` when the piece is new.
    async fn reconcile(&self, name: &str) -> Result<(Piece, bool)> {
        let existing = match self.catalog.find_at(&self.root, name) {
            Some(piece) => piece,
            None => match self.catalog.create_from_file(&self.root, name, PieceRole::Asset).await {
                Ok(piece) => return Ok((piece, true)),
                // Registered meanwhile, e.g. as a virtual piece.
                Err(err) if matches!(&*err, CatalogErrorKind::AlreadyExists(_)) => self
                    .catalog
                    .find_at(&self.root, name)
                    .ok_or_raise(|| ErrorKind::Catalog)?,
                Err(err) => return Err(ErrorKind::catalog(err)),
            },
        };
        let piece = self.catalog.update_from_file(&existing.id).await.map_err(ErrorKind::catalog)?;
        Ok((piece, false))
    }
}

#[derive(Default)]
struct Runtime {
    notifier: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

/// Filesystem watcher for one directory.
///
/// Moves through [`WatcherState::Initializing`], [`WatcherState::Scanning`]
/// and [`WatcherState::Ready`]; it can only be started once.
pub struct Watcher {
    shared: Arc<Shared>,
    queue: WatchQueue,
    started: AtomicBool,
    runtime: Mutex<Runtime>,
}

impl Watcher {
    /// Create the watcher, creating the watch directory if it doesn't exist.
    pub fn new(root: impl AsRef<Path>, catalog: Arc<Catalog>, events: EventBus, options: Options) -> Result<Self> {
        let root = root.as_ref();
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::Directory(root.to_path_buf()));
            }
        } else {
            // Once per process; not worth an async constructor.
            sync_create_dir(root).or_raise(|| ErrorKind::Directory(root.to_path_buf()))?;
        }
        // Notifications report canonical paths on some platforms.
        let root = root.canonicalize().or_raise(|| ErrorKind::Directory(root.to_path_buf()))?;

        let (state, _) = watch::channel(WatcherState::Initializing);
        let shared =
            Arc::new(Shared { root, catalog, events, state, readiness: Mutex::new(Readiness::default()) });
        let queue = Builder::new("watcher").options(options).merge(Latest).build({
            let shared = Arc::clone(&shared);
            move |path: PathBuf, task: Task| {
                let shared = Arc::clone(&shared);
                async move { shared.process(path, task).await }
            }
        });
        Ok(Self { shared, queue, started: AtomicBool::new(false), runtime: Mutex::new(Runtime::default()) })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.shared.state.subscribe()
    }

    /// Wait until the watcher is ready.
    pub async fn ready(&self) {
        let mut state = self.subscribe_state();
        // The sender lives as long as `self`.
        let _ = state.wait_for(|state| *state == WatcherState::Ready).await;
    }

    /// Receives a message every time the watcher has nothing left to do.
    pub fn subscribe_idle(&self) -> broadcast::Receiver<()> {
        self.queue.subscribe_idle()
    }

    /// Subscribe to notifications and start the initial scan.
    ///
    /// Saves the catalog every time the queue drains.
    #[tracing::instrument(skip_all, fields(root = %self.shared.root.display()))]
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            exn::bail!(ErrorKind::AlreadyStarted);
        }
        let (notifier, receiver) = match self.subscribe() {
            Ok(subscription) => subscription,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            },
        };
        self.shared.state.send_replace(WatcherState::Scanning);
        tracing::info!("Watcher started");

        let tasks = vec![
            save_on_idle(Arc::clone(&self.shared.catalog), self.queue.subscribe_idle()),
            tokio::spawn(pump(Arc::clone(&self.shared), self.queue.clone(), receiver)),
            tokio::spawn(initial_scan(Arc::clone(&self.shared), self.queue.clone())),
        ];
        let mut runtime = self.runtime();
        runtime.notifier = Some(notifier);
        runtime.tasks = tasks;
        Ok(())
    }

    /// The surrounding application finished bootstrapping.
    pub fn bootstrapped(&self) {
        self.shared.advance(|readiness| readiness.bootstrapped = true);
    }

    /// Stop listening, finish outstanding work and save the catalog.
    pub async fn stop(&self) -> Result<()> {
        let tasks = {
            let mut runtime = self.runtime();
            runtime.notifier = None;
            std::mem::take(&mut runtime.tasks)
        };
        for task in tasks {
            task.abort();
        }
        self.queue.settled().await;
        self.shared.catalog.save().await.map_err(ErrorKind::catalog)?;
        tracing::info!(root = %self.shared.root.display(), "Watcher stopped");
        Ok(())
    }

    fn subscribe(&self) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Notification>)> {
        let root = &self.shared.root;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut notifier = RecommendedWatcher::new(
            move |notification: Notification| {
                // Only fails once the pump is gone, when nobody cares anymore.
                let _ = sender.send(notification);
            },
            notify::Config::default(),
        )
        .or_raise(|| ErrorKind::Watch(root.clone()))?;
        notifier.watch(root, RecursiveMode::Recursive).or_raise(|| ErrorKind::Watch(root.clone()))?;
        Ok((notifier, receiver))
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        for task in self.runtime().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Queue `task` for every tracked file below `start`.
async fn enqueue_tree(shared: &Shared, queue: &WatchQueue, start: PathBuf, task: Task) -> Vec<Ticket<()>> {
    let mut entries = std::pin::pin!(walk(shared.root.clone(), start));
    let mut tickets = Vec::new();
    while let Some(entry) = entries.next().await {
        match entry {
            Ok(path) => tickets.push(queue.add(path, task)),
            Err(err) => tracing::warn!(error = ?err, "Skipping unreadable directory"),
        }
    }
    tickets
}

async fn initial_scan(shared: Arc<Shared>, queue: WatchQueue) {
    let tickets = enqueue_tree(&shared, &queue, shared.root.clone(), Task::Init).await;
    let total = tickets.len();
    let failed = join_all(tickets).await.into_iter().filter(|result| result.is_err()).count();
    tracing::info!(total, failed, "Initial scan complete");
    shared.advance(|readiness| readiness.scanned = true);
}

async fn pump(shared: Arc<Shared>, queue: WatchQueue, mut receiver: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = receiver.recv().await {
        match notification {
            Ok(event) => {
                for (path, task) in classify(&event.kind, &event.paths) {
                    route(&shared, &queue, path, task).await;
                }
            },
            Err(err) => tracing::warn!(error = %err, "Filesystem notification error"),
        }
    }
}

async fn route(shared: &Shared, queue: &WatchQueue, path: PathBuf, task: Task) {
    let Some(relative) = shared.relative(&path) else {
        tracing::trace!(path = %path.display(), "Discarding notification outside the watch directory");
        return;
    };
    if is_hidden(relative) {
        return;
    }
    if is_tracked(relative) {
        tracing::debug!(path = %path.display(), ?task, "Scheduling reconciliation");
        let _ = queue.add(path, task);
        return;
    }
    // Could have been a directory holding pieces.
    if task == Task::Unlink {
        let _ = queue.add(path, Task::Unlink);
        return;
    }
    if fs::metadata(&path).await.is_ok_and(|metadata| metadata.is_dir()) {
        tracing::debug!(path = %path.display(), "Directory appeared, scanning it");
        enqueue_tree(shared, queue, path, Task::Change).await;
    } else {
        tracing::trace!(path = %path.display(), "Ignoring untracked path");
    }
}

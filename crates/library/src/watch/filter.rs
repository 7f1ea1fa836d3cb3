use freeway_catalog::PieceType;
use notify::EventKind;
use notify::event::{ModifyKind, RenameMode};
use std::path::{Component, Path, PathBuf};

/// What the watcher does with a path once its settle delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    /// Found by the initial scan.
    Init,
    Change,
    Unlink,
}

/// Dotfiles and underscore-prefixed names, at any depth.
pub(crate) fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || name.starts_with('_')
        },
        _ => false,
    })
}

/// Whether the file at `relative` should be tracked as a piece.
pub(crate) fn is_tracked(relative: &Path) -> bool {
    relative.to_str().is_some() && !is_hidden(relative) && PieceType::is_known(relative)
}

/// Turn a notification into tasks. Renames reported as a pair become an
/// unlink of the source and a change of the destination; a rename reported
/// without its counterpart is checked against the filesystem by the change
/// handler.
pub(crate) fn classify(kind: &EventKind, paths: &[PathBuf]) -> Vec<(PathBuf, Task)> {
    let all = |task: Task| -> Vec<(PathBuf, Task)> { paths.iter().map(|path| (path.clone(), task)).collect() };
    match kind {
        EventKind::Create(_) => all(Task::Change),
        EventKind::Remove(_) => all(Task::Unlink),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(Task::Unlink),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths {
            [from, to] => vec![(from.clone(), Task::Unlink), (to.clone(), Task::Change)],
            _ => all(Task::Change),
        },
        EventKind::Modify(_) => all(Task::Change),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

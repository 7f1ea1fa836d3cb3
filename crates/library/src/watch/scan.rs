use crate::error::{Error, ErrorKind, Result};
use crate::watch::filter::{is_hidden, is_tracked};
use async_stream::stream;
use futures::Stream;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(PathBuf),
    Descend(PathBuf),
    Skip,
}

fn read_error(err: std::io::Error, path: &Path) -> Error {
    exn::Exn::from(err).raise(ErrorKind::Read(path.to_path_buf()))
}

async fn process_entry(root: &Path, entry: DirEntry) -> Result<WalkEntry> {
    let path = entry.path();
    let Ok(relative) = path.strip_prefix(root) else {
        return Ok(WalkEntry::Skip);
    };
    if is_hidden(relative) {
        return Ok(WalkEntry::Skip);
    }
    let file_type = entry.file_type().await.map_err(|err| read_error(err, &path))?;
    if file_type.is_dir() {
        return Ok(WalkEntry::Descend(path));
    }
    if file_type.is_file() && is_tracked(relative) {
        return Ok(WalkEntry::File(path));
    }
    // Symlinks and untracked files.
    Ok(WalkEntry::Skip)
}

/// Every tracked file below `start` (itself inside `root`), as absolute paths.
///
/// A directory that disappears mid-walk is simply empty. Other read errors
/// are yielded and the walk carries on with the next directory.
pub(crate) fn walk(root: PathBuf, start: PathBuf) -> impl Stream<Item = Result<PathBuf>> + Send {
    let mut stack = vec![start];
    stream! {
        'dirs: while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    yield Err(read_error(err, &current));
                    continue 'dirs;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(read_error(err, &current));
                        continue 'dirs;
                    }
                };
                match process_entry(&root, entry).await {
                    Ok(WalkEntry::File(path)) => yield Ok(path),
                    Ok(WalkEntry::Descend(path)) => stack.push(path),
                    Ok(WalkEntry::Skip) => {},
                    Err(err) => yield Err(err),
                }
            }
        }
    }
}

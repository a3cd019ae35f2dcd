//! File watcher for the served root.
//!
//! One non-recursive watch per directory, so excluded trees
//! (`node_modules`, the cache directory, `.git`) are never watched at all.
//! Directories created later are picked up as they appear, and files that
//! were already inside them are reported as created.

use notify::{
    event::{ModifyKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Directory names never watched, in addition to the cache directory.
pub const DEFAULT_IGNORED: &[&str] = &["node_modules", ".git"];

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create file watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Changed,
    Created,
    Removed,
}

/// A change to one file under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// Live watcher; dropping it stops event delivery.
pub struct FileWatcher {
    _watcher: Arc<Mutex<RecommendedWatcher>>,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `root`, skipping any directory whose name is in
    /// `ignored`.
    ///
    /// Only changes after this call are reported. Must be called inside a
    /// tokio runtime.
    pub fn start(
        root: &Path,
        ignored: Vec<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchedFileEvent>), WatchError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => error!(error = %e, "watch error"),
            },
            Config::default(),
        )
        .map_err(WatchError::Init)?;
        let watcher = Arc::new(Mutex::new(watcher));

        let root = root.to_path_buf();
        let watched = watch_tree(&watcher, &root, &root, &ignored);
        info!(root = %root.display(), directories = watched, "watching for changes");

        let task = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move {
                while let Some(event) = raw_rx.recv().await {
                    for (path, kind) in classify(&event) {
                        if is_ignored(&root, &path, &ignored) {
                            continue;
                        }
                        if path.is_dir() {
                            if kind == FileChangeKind::Created {
                                watch_tree(&watcher, &root, &path, &ignored);
                                for file in files_in(&root, &path, &ignored) {
                                    debug!(path = %file.display(), "file in new directory");
                                    let event = WatchedFileEvent {
                                        path: file,
                                        kind: FileChangeKind::Created,
                                    };
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            continue;
                        }
                        debug!(path = %path.display(), ?kind, "file event");
                        if tx.send(WatchedFileEvent { path, kind }).is_err() {
                            return;
                        }
                    }
                }
            })
        };

        Ok((
            Self {
                _watcher: watcher,
                task,
            },
            rx,
        ))
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Install a watch on `dir` and every non-ignored directory below it.
///
/// Unreadable entries are logged and skipped. Returns the number of
/// directories watched.
fn watch_tree(
    watcher: &Mutex<RecommendedWatcher>,
    root: &Path,
    dir: &Path,
    ignored: &[String],
) -> usize {
    let mut watcher = watcher.lock().unwrap_or_else(PoisonError::into_inner);
    let mut count = 0;
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_type().is_dir() && !is_ignored(root, e.path(), ignored));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        match watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
            Ok(()) => count += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot watch directory"),
        }
    }
    count
}

/// Regular files under `dir`, skipping ignored directories.
fn files_in(root: &Path, dir: &Path, ignored: &[String]) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_ignored(root, e.path(), ignored))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Whether any component of `path` below `root` is an ignored name.
#[must_use]
pub fn is_ignored(root: &Path, path: &Path, ignored: &[String]) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return true;
    };
    rel.components().any(|c| match c {
        Component::Normal(name) => ignored.iter().any(|i| name == i.as_str()),
        _ => false,
    })
}

/// Map a raw notify event onto per-path changes.
fn classify(event: &Event) -> Vec<(PathBuf, FileChangeKind)> {
    let kind = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            FileChangeKind::Created
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), FileChangeKind::Removed));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), FileChangeKind::Created));
            }
            return out;
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            FileChangeKind::Removed
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => FileChangeKind::Changed,
        _ => return Vec::new(),
    };
    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

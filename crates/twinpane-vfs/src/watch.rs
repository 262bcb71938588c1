//! Directory change notification plumbing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Identifies one watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// What happened to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One change in a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Earlier changes were dropped; the consumer should re-list the directory.
    pub overflow: bool,
}

/// Receiving end of a watch.
#[derive(Debug)]
pub struct WatchSubscription {
    pub id: WatchId,
    pub changes: mpsc::Receiver<DirectoryChange>,
}

#[derive(Debug)]
struct Watcher {
    directory: PathBuf,
    tx: mpsc::Sender<DirectoryChange>,
    overflowed: bool,
}

/// Fan-out of changes to the watchers of a directory.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<WatchId, Watcher>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self, directory: &Path, capacity: usize) -> WatchSubscription {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, changes) = mpsc::channel(capacity.max(1));
        self.watchers.lock().insert(
            id,
            Watcher {
                directory: directory.to_path_buf(),
                tx,
                overflowed: false,
            },
        );
        WatchSubscription { id, changes }
    }

    /// Returns false when `id` was not registered.
    pub fn unwatch(&self, id: WatchId) -> bool {
        self.watchers.lock().remove(&id).is_some()
    }

    /// Deliver a change of `path` to watchers of its parent directory.
    pub fn notify(&self, path: &Path, kind: ChangeKind) {
        let Some(parent) = path.parent() else {
            return;
        };
        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| {
            if watcher.directory != parent {
                return true;
            }
            let change = DirectoryChange {
                path: path.to_path_buf(),
                kind: kind.clone(),
                overflow: watcher.overflowed,
            };
            match watcher.tx.try_send(change) {
                Ok(()) => {
                    watcher.overflowed = false;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    watcher.overflowed = true;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(watch = id.0, "Dropping closed directory watch");
                    false
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

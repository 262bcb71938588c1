//! Shared machinery for the per-item engines.
//!
//! Every backend call that can hit a conflict goes through
//! [`with_conflicts`], which classifies the failure, asks the task for a
//! decision and retries with adjusted flags or target until the call
//! succeeds, the item is skipped or the task stops.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use twinpane_core::{
    EngineConfig, FsError, FsResult, ItemInfo, OperationFlags, ReparsePolicy,
};
use twinpane_vfs::{FileSystem, require};

use crate::conflict::{ConflictAction, ConflictBucket, classify, unique_name};
use crate::diagnostics::{IssueKind, TaskIssue};
use crate::prompt::{Answer, ConflictRequest};
use crate::scheduler::run_blocking;
use crate::task::TaskShared;

/// Everything an item engine needs, cheap to clone into blocking calls.
#[derive(Clone)]
pub(crate) struct ItemContext {
    pub task: Arc<TaskShared>,
    pub source: Arc<dyn FileSystem>,
    pub destination: Arc<dyn FileSystem>,
    pub chunk_size: usize,
    pub reparse_policy: ReparsePolicy,
}

impl ItemContext {
    pub fn new(task: Arc<TaskShared>, config: &EngineConfig) -> Self {
        Self {
            source: task.request.file_system.clone(),
            destination: task.request.destination_fs().clone(),
            chunk_size: config.chunk_size,
            reparse_policy: config.reparse_policy,
            task,
        }
    }

    pub fn flags(&self) -> OperationFlags {
        self.task.request.flags
    }

    pub async fn source_attributes(&self, path: &Path) -> FsResult<ItemInfo> {
        let fs = self.source.clone();
        let path = path.to_path_buf();
        run_blocking(move || require(fs.reader(), "directory listing")?.get_attributes(&path))
            .await
    }

    /// Attributes of a destination path, `None` when nothing is there.
    pub async fn destination_attributes(&self, path: &Path) -> FsResult<Option<ItemInfo>> {
        let fs = self.destination.clone();
        let path = path.to_path_buf();
        run_blocking(move || {
            match require(fs.reader(), "directory listing")?.get_attributes(&path) {
                Ok(item) => Ok(Some(item)),
                Err(FsError::NotFound { .. }) => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
    }

    pub async fn list_source(&self, dir: &Path) -> FsResult<Vec<ItemInfo>> {
        let fs = self.source.clone();
        let dir = dir.to_path_buf();
        run_blocking(move || require(fs.reader(), "directory listing")?.read_directory_info(&dir))
            .await
    }

    /// A free sibling name for `path` on the destination.
    async fn free_name(&self, path: &Path) -> FsResult<PathBuf> {
        let fs = self.destination.clone();
        let path = path.to_path_buf();
        run_blocking(move || {
            let reader = require(fs.reader(), "directory listing")?;
            Ok(unique_name(&path, |candidate| {
                reader.get_attributes(candidate).is_ok()
            }))
        })
        .await
    }

    /// Handle a failure no prompt can resolve.
    ///
    /// With `CONTINUE_ON_ERROR` the item fails alone; otherwise the task
    /// aborts with the error's code.
    pub fn fatal(&self, path: &Path, err: &FsError) -> ItemStop {
        if matches!(err, FsError::Cancelled) || self.task.halt.is_cancelled() {
            return ItemStop::Halted;
        }
        if self.flags().contains(OperationFlags::CONTINUE_ON_ERROR) {
            warn!(task = %self.task.id, path = %path.display(), error = %err, "item failed");
            self.task.record(TaskIssue::error(
                IssueKind::Failed,
                Some(path),
                err.to_string(),
                err.code(),
            ));
            ItemStop::Failed
        } else {
            warn!(task = %self.task.id, path = %path.display(), error = %err, "aborting task");
            self.task.record(TaskIssue::error(
                IssueKind::Aborted,
                Some(path),
                err.to_string(),
                err.code(),
            ));
            self.task.abort_with(err.code());
            ItemStop::Halted
        }
    }
}

/// Why an item did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemStop {
    Skipped,
    Failed,
    /// The task was cancelled or aborted.
    Halted,
}

/// What an item engine did for one top-level item.
#[derive(Debug, Default)]
pub(crate) struct ItemReport {
    pub bytes: u64,
    /// Entries below the item that were skipped.
    pub skipped: u64,
    pub failed: u64,
    /// Source files and links whose copy completed.
    pub copied: Vec<PathBuf>,
    /// Directories created or merged, source and destination, in pre-order.
    pub dirs: Vec<(PathBuf, PathBuf)>,
}

impl ItemReport {
    pub fn is_partial(&self) -> bool {
        self.skipped > 0 || self.failed > 0
    }

    /// Account for a nested entry; only a halt ends the enclosing item.
    pub fn settle(&mut self, outcome: Result<(), ItemStop>) -> Result<(), ItemStop> {
        match outcome {
            Ok(()) => Ok(()),
            Err(ItemStop::Skipped) => {
                self.skipped += 1;
                Ok(())
            }
            Err(ItemStop::Failed) => {
                self.failed += 1;
                Ok(())
            }
            Err(ItemStop::Halted) => Err(ItemStop::Halted),
        }
    }
}

/// Path and flags of one attempt.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub path: PathBuf,
    pub flags: OperationFlags,
}

impl Target {
    pub fn new(path: impl Into<PathBuf>, flags: OperationFlags) -> Self {
        Self {
            path: path.into(),
            flags,
        }
    }
}

/// Run `op` until it succeeds, resolving conflicts through the task.
///
/// Returns the value and the target of the successful attempt, which
/// differs from the initial one after KeepBoth.
pub(crate) async fn with_conflicts<T, F, Fut>(
    ctx: &ItemContext,
    source: &Path,
    target: Target,
    op: F,
) -> Result<(T, Target), ItemStop>
where
    F: Fn(Target) -> Fut,
    Fut: Future<Output = FsResult<T>>,
{
    let task = &ctx.task;
    let mut target = target;
    let mut retry_failed = false;
    let mut last: Option<(ConflictBucket, Answer)> = None;

    loop {
        task.checkpoint().await.map_err(|_| ItemStop::Halted)?;

        let err = match op(target.clone()).await {
            Ok(value) => return Ok((value, target)),
            Err(err) => err,
        };
        let Some(bucket) = classify(&err) else {
            return Err(ctx.fatal(source, &err));
        };

        let previous = last.filter(|(b, _)| *b == bucket).map(|(_, answer)| answer);
        if previous.is_some_and(|a| a.action == ConflictAction::Retry) {
            retry_failed = true;
        }
        let cached_failed = previous.is_some_and(|a| a.from_cache);

        debug!(task = %task.id, path = %source.display(), %bucket, retry_failed, cached_failed, "conflict");
        let answer = task
            .resolve_conflict(ConflictRequest {
                bucket,
                source: source.to_path_buf(),
                destination: task
                    .request
                    .kind
                    .needs_destination()
                    .then(|| target.path.clone()),
                retry_failed,
                cached_failed,
                message: format!("{}: {err}", bucket.describe()),
            })
            .await;
        last = Some((bucket, answer));

        match answer.action {
            ConflictAction::Overwrite => target.flags |= OperationFlags::ALLOW_OVERWRITE,
            ConflictAction::ReplaceReadOnly => {
                target.flags |=
                    OperationFlags::ALLOW_OVERWRITE | OperationFlags::ALLOW_REPLACE_READONLY;
            }
            ConflictAction::KeepBoth => {
                target.path = match ctx.free_name(&target.path).await {
                    Ok(path) => path,
                    Err(err) => return Err(ctx.fatal(source, &err)),
                };
            }
            ConflictAction::Retry => {}
            ConflictAction::Skip | ConflictAction::SkipAll => {
                task.record(TaskIssue::warning(
                    IssueKind::Skipped,
                    Some(source),
                    format!("Skipped: {err}"),
                    bucket.abort_code(),
                ));
                return Err(ItemStop::Skipped);
            }
            ConflictAction::Cancel => return Err(ItemStop::Halted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_counts_nested_stops() {
        let mut report = ItemReport::default();
        assert_eq!(report.settle(Ok(())), Ok(()));
        assert_eq!(report.settle(Err(ItemStop::Skipped)), Ok(()));
        assert_eq!(report.settle(Err(ItemStop::Failed)), Ok(()));
        assert_eq!(
            report.settle(Err(ItemStop::Halted)),
            Err(ItemStop::Halted)
        );
        assert_eq!((report.skipped, report.failed), (1, 1));
        assert!(report.is_partial());
    }
}

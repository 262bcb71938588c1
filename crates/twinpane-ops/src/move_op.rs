//! Move engine: rename when possible, otherwise copy then delete.

use std::path::PathBuf;

use tracing::{debug, warn};

use twinpane_core::{FsError, ItemInfo, OperationFlags};
use twinpane_vfs::require;

use crate::copy;
use crate::diagnostics::{IssueKind, TaskIssue};
use crate::item::{ItemContext, ItemReport, ItemStop, Target, with_conflicts};
use crate::reparse;
use crate::scheduler::run_blocking;

/// How a rename attempt ended.
enum Renamed {
    Done,
    /// The backend cannot rename this pair; copy instead.
    Fallback,
}

/// Move one top-level item to `destination`, its full target path.
pub(crate) async fn move_item(
    ctx: &ItemContext,
    item: &ItemInfo,
    destination: PathBuf,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    // Links that have to be skipped must not be renamed away either,
    // including those nested in a directory.
    let same_backend = !ctx.task.request.is_cross_backend();
    let mut link_blocked = false;
    if same_backend && !reparse::can_recreate(ctx) {
        link_blocked = item.kind.link().is_some();
        if item.is_dir() {
            link_blocked = match reparse::tree_has_link(ctx, &item.path).await {
                Ok(found) => found,
                Err(FsError::Cancelled) => return Err(ItemStop::Halted),
                Err(err) => return Err(ctx.fatal(&item.path, &err)),
            };
        }
    }

    if same_backend && !link_blocked {
        let existing = match ctx.destination_attributes(&destination).await {
            Ok(existing) => existing,
            Err(err) => return Err(ctx.fatal(&destination, &err)),
        };
        // Directories merge into an existing target, which needs the copy path.
        let renamable = match &existing {
            None => true,
            Some(target) => !target.is_dir() && !item.is_dir(),
        };
        if renamable && rename(ctx, item, destination.clone(), report).await? {
            return Ok(());
        }
    }

    copy::copy_item(ctx, item, destination, report).await?;
    remove_sources(ctx, report).await
}

/// Try a rename; `Ok(false)` asks for the copy fallback.
async fn rename(
    ctx: &ItemContext,
    item: &ItemInfo,
    destination: PathBuf,
    report: &mut ItemReport,
) -> Result<bool, ItemStop> {
    let from = item.path.clone();
    let (renamed, target) = with_conflicts(
        ctx,
        &item.path,
        Target::new(destination, ctx.flags()),
        |target| {
            let fs = ctx.source.clone();
            let from = from.clone();
            run_blocking(move || {
                let operations = require(fs.operations(), "directory operations")?;
                match operations.rename_item(&from, &target.path, target.flags) {
                    Ok(()) => Ok(Renamed::Done),
                    Err(err) if err.is_cross_device() => Ok(Renamed::Fallback),
                    Err(FsError::NotSupported { .. }) => Ok(Renamed::Fallback),
                    Err(err) => Err(err),
                }
            })
        },
    )
    .await?;

    match renamed {
        Renamed::Done => {
            debug!(task = %ctx.task.id, from = %item.path.display(), to = %target.path.display(), "renamed");
            ctx.task.progress.lock().add_bytes(item.size);
            report.bytes += item.size;
            Ok(true)
        }
        Renamed::Fallback => Ok(false),
    }
}

/// Delete the sources whose copy completed, then the emptied directories.
///
/// Directories still holding skipped entries stay behind.
async fn remove_sources(ctx: &ItemContext, report: &mut ItemReport) -> Result<(), ItemStop> {
    let copied = std::mem::take(&mut report.copied);
    let dirs: Vec<PathBuf> = report.dirs.iter().map(|(source, _)| source.clone()).collect();
    let worker = ctx.clone();

    let failures = run_blocking(move || {
        let operations = require(worker.source.operations(), "directory operations")?;
        let mut failures = Vec::new();

        for path in &copied {
            if worker.task.halt.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            if let Err(err) = operations.delete_item(path, OperationFlags::ALLOW_REPLACE_READONLY)
            {
                failures.push(err);
            }
        }
        for dir in dirs.iter().rev() {
            match operations.delete_item(dir, OperationFlags::ALLOW_REPLACE_READONLY) {
                Ok(()) | Err(FsError::DirectoryNotEmpty { .. }) => {}
                Err(err) => failures.push(err),
            }
        }
        Ok(failures)
    })
    .await;

    let failures = match failures {
        Ok(failures) => failures,
        Err(FsError::Cancelled) => return Err(ItemStop::Halted),
        Err(err) => vec![err],
    };
    for err in failures {
        warn!(task = %ctx.task.id, error = %err, "source not removed after move");
        ctx.task.record(TaskIssue::warning(
            IssueKind::Cleanup,
            err.path(),
            format!("Moved item left at source: {err}"),
            err.code(),
        ));
        report.failed += 1;
    }
    Ok(())
}

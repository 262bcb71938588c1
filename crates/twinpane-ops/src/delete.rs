//! Delete engine.

use std::path::{Path, PathBuf};

use twinpane_core::{ItemInfo, ItemKind, OperationFlags};
use twinpane_vfs::require;

use crate::item::{ItemContext, ItemReport, ItemStop, Target, with_conflicts};
use crate::scheduler::run_blocking;

/// Delete one top-level item.
///
/// Recycle-bin deletes and plain files go in one call. A directory without
/// `RECURSIVE` is removed only when empty; with it, files go first and
/// directories deepest first, so a skipped file keeps its parents alive.
pub(crate) async fn delete_item(
    ctx: &ItemContext,
    item: &ItemInfo,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    let flags = ctx.flags();

    if flags.contains(OperationFlags::USE_RECYCLE_BIN) || !item.is_dir() {
        remove(ctx, &item.path, flags, item.size, report).await?;
        return Ok(());
    }
    if !flags.contains(OperationFlags::RECURSIVE) {
        return remove(ctx, &item.path, flags, 0, report).await;
    }

    let mut dirs: Vec<PathBuf> = vec![item.path.clone()];
    let mut pending: Vec<PathBuf> = vec![item.path.clone()];

    while let Some(dir) = pending.pop() {
        ctx.task.checkpoint().await.map_err(|_| ItemStop::Halted)?;

        let entries = match ctx.list_source(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                report.settle(Err(ctx.fatal(&dir, &err)))?;
                continue;
            }
        };
        for entry in entries {
            match entry.kind {
                ItemKind::Directory => {
                    dirs.push(entry.path.clone());
                    pending.push(entry.path);
                }
                ItemKind::File | ItemKind::Link(_) => {
                    let outcome = remove(ctx, &entry.path, flags, entry.size, report).await;
                    report.settle(outcome)?;
                }
            }
        }
    }

    let shallow = flags - OperationFlags::RECURSIVE;
    for dir in dirs.iter().rev() {
        if report.is_partial() && !dir_is_empty(ctx, dir).await {
            continue;
        }
        let outcome = remove(ctx, dir, shallow, 0, report).await;
        report.settle(outcome)?;
    }
    Ok(())
}

async fn dir_is_empty(ctx: &ItemContext, dir: &Path) -> bool {
    ctx.list_source(dir)
        .await
        .map(|entries| entries.is_empty())
        .unwrap_or(false)
}

/// Delete one entry, resolving read-only and locked conflicts.
async fn remove(
    ctx: &ItemContext,
    path: &Path,
    flags: OperationFlags,
    size: u64,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    with_conflicts(ctx, path, Target::new(path, flags), |target| {
        let fs = ctx.source.clone();
        run_blocking(move || {
            require(fs.operations(), "directory operations")?
                .delete_item(&target.path, target.flags)
        })
    })
    .await?;

    ctx.task.progress.lock().add_bytes(size);
    report.bytes += size;
    Ok(())
}

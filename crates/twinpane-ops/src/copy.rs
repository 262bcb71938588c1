//! Copy engine: streams files between backends and rebuilds directory trees.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use twinpane_core::{FsError, FsResult, ItemInfo, ItemKind, OperationFlags};
use twinpane_vfs::{FileReader, FileWriter, WriteOptions, require};

use crate::diagnostics::{IssueKind, TaskIssue};
use crate::item::{ItemContext, ItemReport, ItemStop, Target, with_conflicts};
use crate::reparse;
use crate::scheduler::run_blocking;
use crate::task::TaskShared;

/// Copy one top-level item to `destination`, its full target path.
pub(crate) async fn copy_item(
    ctx: &ItemContext,
    item: &ItemInfo,
    destination: PathBuf,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    match &item.kind {
        ItemKind::File => copy_file(ctx, &item.path, destination, report).await,
        ItemKind::Directory => copy_directory(ctx, &item.path, destination, report).await,
        ItemKind::Link(link) => {
            reparse::copy_link(ctx, &item.path, link, destination, None, report).await
        }
    }
}

/// Copy one file, resolving conflicts on the destination.
pub(crate) async fn copy_file(
    ctx: &ItemContext,
    source: &Path,
    destination: PathBuf,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    let from = source.to_path_buf();
    let (bytes, _) = with_conflicts(
        ctx,
        source,
        Target::new(destination, ctx.flags()),
        |target| {
            let ctx = ctx.clone();
            let from = from.clone();
            run_blocking(move || transfer(&ctx, &from, &target))
        },
    )
    .await?;

    report.bytes += bytes;
    report.copied.push(from);
    Ok(())
}

/// Stream `source` into the target through an atomic writer.
///
/// Runs on the blocking pool. Bytes are counted as they move and rolled
/// back when the transfer does not complete.
fn transfer(ctx: &ItemContext, source: &Path, target: &Target) -> FsResult<u64> {
    let task = &ctx.task;
    let source_io = require(ctx.source.io(), "file reading")?;
    let destination_io = require(ctx.destination.io(), "file writing")?;

    let mut reader = source_io.create_file_reader(source)?;
    let mut writer =
        destination_io.create_file_writer(&target.path, WriteOptions::from_flags(target.flags))?;

    let mut moved = 0;
    let pumped = pump(task, ctx.chunk_size, reader.as_mut(), writer.as_mut(), &mut moved);
    let committed = match pumped {
        Ok(()) => writer.commit(),
        Err(err) => {
            writer.abort();
            Err(err)
        }
    };
    if let Err(err) = committed {
        task.progress.lock().rollback(moved);
        return Err(err);
    }

    copy_basic_info(ctx, source, &target.path);
    Ok(moved)
}

fn pump(
    task: &TaskShared,
    chunk_size: usize,
    reader: &mut dyn FileReader,
    writer: &mut dyn FileWriter,
    moved: &mut u64,
) -> FsResult<()> {
    let mut buf = vec![0u8; chunk_size];
    let halted = || task.halt.is_cancelled();

    loop {
        task.checkpoint_blocking()?;

        let len = task.limiter.chunk_len(chunk_size);
        let n = reader.read_chunk(&mut buf[..len])?;
        if n == 0 {
            return Ok(());
        }
        if !task.limiter.acquire_blocking(n, &halted) {
            return Err(FsError::Cancelled);
        }
        writer.write_chunk(&buf[..n])?;

        *moved += n as u64;
        task.progress.lock().add_bytes(n as u64);
    }
}

/// Carry timestamps and attributes over. Failures only warn.
fn copy_basic_info(ctx: &ItemContext, source: &Path, destination: &Path) {
    let copied = require(ctx.source.io(), "file reading")
        .and_then(|io| io.get_file_basic_information(source))
        .and_then(|info| {
            require(ctx.destination.io(), "file writing")?
                .set_file_basic_information(destination, &info)
        });
    if let Err(err) = copied {
        debug!(task = %ctx.task.id, path = %destination.display(), error = %err, "metadata not copied");
        ctx.task.record(TaskIssue::warning(
            IssueKind::Metadata,
            Some(destination),
            format!("Timestamps or attributes not copied: {err}"),
            err.code(),
        ));
    }
}

/// Create `destination` as a directory, merging into one that already exists.
///
/// Returns the directory actually used, which differs after KeepBoth.
async fn ensure_directory(
    ctx: &ItemContext,
    source: &Path,
    destination: PathBuf,
) -> Result<PathBuf, ItemStop> {
    let (_, target) = with_conflicts(
        ctx,
        source,
        Target::new(destination, ctx.flags()),
        |target| {
            let fs = ctx.destination.clone();
            run_blocking(move || {
                let operations = require(fs.operations(), "directory operations")?;
                match operations.create_directory(&target.path) {
                    Err(FsError::AlreadyExists { path }) => {
                        let existing = require(fs.reader(), "directory listing")?
                            .get_attributes(&target.path)?;
                        if existing.is_dir() {
                            return Ok(());
                        }
                        if !target.flags.contains(OperationFlags::ALLOW_OVERWRITE) {
                            return Err(FsError::AlreadyExists { path });
                        }
                        operations.delete_item(&target.path, target.flags)?;
                        operations.create_directory(&target.path)
                    }
                    other => other,
                }
            })
        },
    )
    .await?;
    Ok(target.path)
}

/// Copy a directory tree, pre-order, without following links.
///
/// A skipped or failed entry does not stop its siblings.
async fn copy_directory(
    ctx: &ItemContext,
    source: &Path,
    destination: PathBuf,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    let root = ensure_directory(ctx, source, destination).await?;
    report.dirs.push((source.to_path_buf(), root.clone()));

    if ctx.flags().contains(OperationFlags::RECURSIVE) {
        let tree = (source.to_path_buf(), root.clone());
        let mut pending = vec![tree.clone()];

        while let Some((dir, target_dir)) = pending.pop() {
            ctx.task.checkpoint().await.map_err(|_| ItemStop::Halted)?;

            let entries = match ctx.list_source(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    report.settle(Err(ctx.fatal(&dir, &err)))?;
                    continue;
                }
            };

            for entry in entries {
                let target = target_dir.join(entry.name.as_str());
                let outcome = match &entry.kind {
                    ItemKind::File => copy_file(ctx, &entry.path, target, report).await,
                    ItemKind::Directory => {
                        match ensure_directory(ctx, &entry.path, target).await {
                            Ok(created) => {
                                report.dirs.push((entry.path.clone(), created.clone()));
                                pending.push((entry.path.clone(), created));
                                Ok(())
                            }
                            Err(stop) => Err(stop),
                        }
                    }
                    ItemKind::Link(link) => {
                        reparse::copy_link(ctx, &entry.path, link, target, Some(&tree), report)
                            .await
                    }
                };
                report.settle(outcome)?;
            }
        }
    }

    apply_directory_info(ctx, report).await;
    Ok(())
}

/// Stamp created directories deepest first, once their contents are written.
async fn apply_directory_info(ctx: &ItemContext, report: &ItemReport) {
    let dirs = report.dirs.clone();
    let worker = ctx.clone();
    let applied = run_blocking(move || {
        for (source, destination) in dirs.iter().rev() {
            if worker.task.halt.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            copy_basic_info(&worker, source, destination);
        }
        Ok(())
    })
    .await;
    if let Err(err) = applied {
        if !matches!(err, FsError::Cancelled) {
            warn!(task = %ctx.task.id, error = %err, "directory metadata pass failed");
        }
    }
}

//! Links met while copying or moving.
//!
//! Links are never followed. Under [`ReparsePolicy::CopyReparse`] they are
//! recreated at the destination; a target inside the copied tree is
//! rewritten to the matching destination path, anything else is kept as
//! stored. A destination without link support, or the skip policy, turns
//! the link into an `UnsupportedReparse` conflict.

use std::path::{Path, PathBuf};

use tracing::debug;

use twinpane_core::{FsError, FsResult, LinkInfo, OperationFlags, ReparsePolicy};
use twinpane_vfs::require;

use crate::item::{ItemContext, ItemReport, ItemStop, Target, with_conflicts};
use crate::scheduler::run_blocking;

/// Whether links can be reproduced for this task at all.
pub(crate) fn can_recreate(ctx: &ItemContext) -> bool {
    ctx.reparse_policy == ReparsePolicy::CopyReparse && ctx.destination.links().is_some()
}

/// Whether the tree under `root` holds a link anywhere.
pub(crate) async fn tree_has_link(ctx: &ItemContext, root: &Path) -> FsResult<bool> {
    let fs = ctx.source.clone();
    let task = ctx.task.clone();
    let root = root.to_path_buf();
    run_blocking(move || {
        let reader = require(fs.reader(), "directory listing")?;
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            if task.halt.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            for entry in reader.read_directory_info(&dir)? {
                if entry.kind.link().is_some() {
                    return Ok(true);
                }
                if entry.is_dir() {
                    pending.push(entry.path);
                }
            }
        }
        Ok(false)
    })
    .await
}

/// Target for the recreated link.
///
/// `tree` is the source root being copied and its destination.
pub(crate) fn rewrite_target(target: &Path, tree: Option<&(PathBuf, PathBuf)>) -> PathBuf {
    match tree {
        Some((source_root, destination_root)) if target.is_absolute() => {
            match target.strip_prefix(source_root) {
                Ok(rest) if rest.as_os_str().is_empty() => destination_root.clone(),
                Ok(rest) => destination_root.join(rest),
                Err(_) => target.to_path_buf(),
            }
        }
        _ => target.to_path_buf(),
    }
}

/// Recreate the link at `source` as `destination`.
pub(crate) async fn copy_link(
    ctx: &ItemContext,
    source: &Path,
    link: &LinkInfo,
    destination: PathBuf,
    tree: Option<&(PathBuf, PathBuf)>,
    report: &mut ItemReport,
) -> Result<(), ItemStop> {
    if !can_recreate(ctx) {
        let unsupported = source.to_path_buf();
        // Only Skip or Cancel get past this.
        with_conflicts(
            ctx,
            source,
            Target::new(destination, ctx.flags()),
            |_| {
                let path = unsupported.clone();
                std::future::ready(Err::<(), _>(FsError::UnsupportedReparse { path }))
            },
        )
        .await?;
        return Ok(());
    }

    let kind = link.kind;
    let link_target = rewrite_target(&link.target, tree);
    debug!(task = %ctx.task.id, path = %source.display(), target = %link_target.display(), %kind, "recreating link");

    with_conflicts(
        ctx,
        source,
        Target::new(destination, ctx.flags()),
        |target| {
            let fs = ctx.destination.clone();
            let link_target = link_target.clone();
            run_blocking(move || {
                let links = require(fs.links(), "links")?;
                match links.create_link(&target.path, kind, &link_target) {
                    Err(FsError::AlreadyExists { path })
                        if target.flags.contains(OperationFlags::ALLOW_OVERWRITE) =>
                    {
                        let existing = require(fs.reader(), "directory listing")?
                            .get_attributes(&target.path)?;
                        if existing.is_dir() {
                            return Err(FsError::AlreadyExists { path });
                        }
                        require(fs.operations(), "directory operations")?
                            .delete_item(&target.path, target.flags)?;
                        links.create_link(&target.path, kind, &link_target)
                    }
                    other => other,
                }
            })
        },
    )
    .await?;

    report.copied.push(source.to_path_buf());
    Ok(())
}

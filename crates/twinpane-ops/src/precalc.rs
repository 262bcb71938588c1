//! Pre-calculation: sizing a task's sources before the transfer starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use twinpane_core::{FsError, FsResult, ItemKind, SizeTotals};
use twinpane_vfs::{WalkControl, require};

use crate::diagnostics::{IssueKind, TaskIssue};
use crate::scheduler::run_blocking;
use crate::task::{Stage, TaskShared};

/// Sizing state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreCalcTotals {
    /// Totals found so far (final once `completed`).
    pub totals: SizeTotals,
    pub in_progress: bool,
    pub skipped: bool,
    pub completed: bool,
}

enum WalkEnd {
    Done(FsResult<SizeTotals>),
    Skipped,
    Halted,
}

/// Size every source of the task.
///
/// File roots are resolved from their attributes without walking. Directory
/// roots are walked on the blocking pool, once the task has its queue turn,
/// while holding one of the orchestrator's pre-calculation slots. The walk
/// stops in place for pause and queue turns. `Err` means the task halted.
pub(crate) async fn run(task: &Arc<TaskShared>, slots: &Arc<Semaphore>) -> FsResult<()> {
    task.update_precalc(|p| p.in_progress = true);

    let mut totals = SizeTotals::new();
    let mut directories: Vec<PathBuf> = Vec::new();

    for source in task.request.sources.clone() {
        if task.precalc_skip.is_cancelled() {
            finish_skipped(task);
            return Ok(());
        }
        let fs = task.request.file_system.clone();
        let path = source.clone();
        let attributes = run_blocking(move || {
            let reader = require(fs.reader(), "directory listing")?;
            reader.get_attributes(&path)
        })
        .await;

        match attributes {
            Ok(item) => match item.kind {
                ItemKind::Directory => directories.push(item.path),
                ItemKind::File => totals.merge(&SizeTotals::single_file(item.size)),
                ItemKind::Link(_) => totals.merge(&SizeTotals::single_file(0)),
            },
            Err(FsError::Cancelled) => return halt(task),
            Err(err) => record_failure(task, &source, &err),
        }
        if task.halt.is_cancelled() {
            return halt(task);
        }
    }
    task.update_precalc(|p| p.totals = totals);

    if directories.is_empty() {
        finish(task, totals, true);
        return Ok(());
    }

    // Sizing waits for the queue turn too.
    task.set_stage(Stage::PreCalculating);
    let observe = || task.publish_phase();
    tokio::select! {
        biased;
        _ = task.halt.cancelled() => return halt(task),
        _ = task.precalc_skip.cancelled() => {
            finish_skipped(task);
            return Ok(());
        }
        passed = task.gate.pass(&observe) => {
            if passed.is_err() {
                return halt(task);
            }
        }
    }

    let permit = tokio::select! {
        biased;
        _ = task.halt.cancelled() => return halt(task),
        _ = task.precalc_skip.cancelled() => {
            finish_skipped(task);
            return Ok(());
        }
        permit = slots.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return halt(task),
        },
    };

    debug!(task = %task.id, roots = directories.len(), "sizing sources");

    let walker = {
        let task = task.clone();
        let base = totals;
        tokio::task::spawn_blocking(move || walk_all(&task, base, &directories))
    };

    let end = tokio::select! {
        biased;
        _ = task.halt.cancelled() => WalkEnd::Halted,
        _ = task.precalc_skip.cancelled() => WalkEnd::Skipped,
        joined = walker => match joined {
            Ok(result) => WalkEnd::Done(result),
            Err(err) => WalkEnd::Done(Err(FsError::backend("", format!("sizing worker failed: {err}")))),
        },
    };
    // The slot is free again whichever way the walk ended.
    drop(permit);

    match end {
        WalkEnd::Done(Ok(totals)) => {
            finish(task, totals, true);
            Ok(())
        }
        WalkEnd::Done(Err(FsError::Cancelled)) | WalkEnd::Halted => {
            if task.precalc_skip.is_cancelled() && !task.halt.is_cancelled() {
                finish_skipped(task);
                return Ok(());
            }
            halt(task)
        }
        WalkEnd::Done(Err(err)) => {
            record_failure(task, err.path().unwrap_or(Path::new("")), &err);
            let partial = task.precalc().totals;
            finish(task, partial, false);
            Ok(())
        }
        WalkEnd::Skipped => {
            finish_skipped(task);
            Ok(())
        }
    }
}

fn walk_all(task: &Arc<TaskShared>, base: SizeTotals, roots: &[PathBuf]) -> FsResult<SizeTotals> {
    let reader = require(task.request.file_system.reader(), "directory listing")?;
    let mut totals = base;

    let skip = || task.precalc_skip.is_cancelled();
    let observe = || task.publish_phase();
    let stop = || task.gate.pass_blocking_until(&skip, &observe).is_err();

    for root in roots {
        let before = totals;
        let progress = |partial: &SizeTotals| {
            let mut running = before;
            running.merge(partial);
            task.update_precalc(|p| p.totals = running);
        };
        let control = WalkControl::none()
            .with_stop(&stop)
            .with_progress(&progress);
        let found = reader.get_directory_size(root, &control)?;
        totals.merge(&found);
        task.update_precalc(|p| p.totals = totals);
    }
    Ok(totals)
}

fn finish(task: &TaskShared, totals: SizeTotals, completed: bool) {
    task.update_precalc(|p| {
        p.totals = totals;
        p.in_progress = false;
        p.completed = completed;
    });
    debug!(task = %task.id, bytes = totals.total_bytes, files = totals.file_count, completed, "sizing finished");
}

fn finish_skipped(task: &TaskShared) {
    task.update_precalc(|p| {
        p.in_progress = false;
        p.skipped = true;
        p.completed = false;
    });
    debug!(task = %task.id, "sizing skipped");
}

fn halt(task: &TaskShared) -> FsResult<()> {
    task.update_precalc(|p| p.in_progress = false);
    Err(FsError::Cancelled)
}

fn record_failure(task: &TaskShared, path: &Path, err: &FsError) {
    warn!(task = %task.id, path = %path.display(), error = %err, "could not size source");
    task.record(TaskIssue::warning(
        IssueKind::PreCalc,
        Some(path),
        format!("Could not size: {err}"),
        err.code(),
    ));
}

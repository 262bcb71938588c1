//! Task runner: sizing, the item fan-out and the terminal result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use twinpane_core::{
    EngineConfig, ExecutionMode, FsError, OperationKind, ResultCode, item_name,
};
use twinpane_vfs::require;

use crate::copy;
use crate::delete;
use crate::diagnostics::{IssueKind, TaskIssue};
use crate::events::TaskEvent;
use crate::item::{ItemContext, ItemReport, ItemStop};
use crate::move_op;
use crate::precalc;
use crate::progress::ItemEnd;
use crate::scheduler::run_blocking;
use crate::task::{Stage, TaskShared};

/// Orchestrator resources a runner draws from.
#[derive(Debug, Clone)]
pub(crate) struct RunEnv {
    pub config: Arc<EngineConfig>,
    pub precalc_slots: Arc<Semaphore>,
    pub shared_budget: Arc<Semaphore>,
}

/// Run a task to its terminal result.
pub(crate) async fn run(task: Arc<TaskShared>, env: RunEnv) -> ResultCode {
    let span = info_span!("task", id = %task.id, kind = %task.request.kind);
    async move {
        task.emit(TaskEvent::Started {
            id: task.id,
            kind: task.request.kind,
        });
        task.publish_phase();
        info!(
            sources = task.request.sources.len(),
            destination = ?task.request.destination,
            flags = %task.request.flags.describe(),
            mode = %task.request.execution_mode,
            "task started"
        );

        execute(&task, &env).await;
        let code = conclude(&task);
        info!(result = %code, "task finished");
        code
    }
    .instrument(span)
    .await
}

async fn execute(task: &Arc<TaskShared>, env: &RunEnv) {
    if precalc::run(task, &env.precalc_slots).await.is_err() {
        return;
    }

    task.set_stage(Stage::Running);
    if task.checkpoint().await.is_err() {
        return;
    }
    task.mark_started();

    let ctx = ItemContext::new(task.clone(), &env.config);
    if task.request.kind.needs_destination() && prepare_destination(&ctx).await.is_err() {
        return;
    }

    let sources = task.request.sources.clone();
    match task.request.execution_mode {
        ExecutionMode::BulkItems => {
            let limit = task.scheduler.limit();
            futures::stream::iter(sources)
                .for_each_concurrent(limit, |source| run_item(&ctx, source, None))
                .await;
        }
        ExecutionMode::PerItem => {
            let mut items = JoinSet::new();
            for source in sources {
                let ctx = ctx.clone();
                let budget = env.shared_budget.clone();
                items.spawn(async move { run_item(&ctx, source, Some(&budget)).await });
            }
            while let Some(joined) = items.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "item worker failed");
                    task.record(TaskIssue::error(
                        IssueKind::Failed,
                        None,
                        format!("Item worker failed: {err}"),
                        ResultCode::Failed,
                    ));
                    task.mark_partial();
                }
            }
        }
    }
}

/// Create the destination folder when it does not exist yet.
async fn prepare_destination(ctx: &ItemContext) -> Result<(), ItemStop> {
    let Some(destination) = ctx.task.request.destination.clone() else {
        return Ok(());
    };
    let fs = ctx.destination.clone();
    let target = destination.clone();
    let prepared = run_blocking(move || {
        let reader = require(fs.reader(), "directory listing")?;
        let operations = require(fs.operations(), "directory operations")?;
        let missing: Vec<&Path> = target
            .ancestors()
            .take_while(|dir| reader.get_attributes(dir).is_err())
            .collect();
        for dir in missing.into_iter().rev() {
            match operations.create_directory(dir) {
                Ok(()) | Err(FsError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
    .await;

    prepared.map_err(|err| {
        ctx.task.record(TaskIssue::error(
            IssueKind::Aborted,
            Some(&destination),
            format!("Destination folder unavailable: {err}"),
            err.code(),
        ));
        if !matches!(err, FsError::Cancelled) {
            ctx.task.abort_with(err.code());
        }
        ItemStop::Halted
    })
}

async fn run_item(ctx: &ItemContext, source: PathBuf, budget: Option<&Arc<Semaphore>>) {
    let task = &ctx.task;
    if task.halt.is_cancelled() {
        return;
    }
    let _slot = tokio::select! {
        biased;
        _ = task.halt.cancelled() => return,
        slot = task.scheduler.acquire(budget) => match slot {
            Some(slot) => slot,
            None => return,
        },
    };
    if task.checkpoint().await.is_err() {
        return;
    }

    task.progress.lock().set_current(Some(source.clone()));
    let mut report = ItemReport::default();
    let outcome = process(ctx, &source, &mut report).await;

    let end = match outcome {
        Ok(folder) => ItemEnd::Completed { folder },
        Err(ItemStop::Skipped) => ItemEnd::Skipped,
        Err(ItemStop::Failed) => ItemEnd::Failed,
        Err(ItemStop::Halted) => ItemEnd::Halted,
    };
    if report.is_partial() || matches!(end, ItemEnd::Skipped | ItemEnd::Failed) {
        task.mark_partial();
    }
    task.progress.lock().finish_item(end, report.bytes);
}

/// Dispatch one top-level item; `Ok` carries whether it was a folder.
async fn process(
    ctx: &ItemContext,
    source: &Path,
    report: &mut ItemReport,
) -> Result<bool, ItemStop> {
    let item = match ctx.source_attributes(source).await {
        Ok(item) => item,
        Err(err) => return Err(ctx.fatal(source, &err)),
    };
    let folder = item.is_dir();

    match ctx.task.request.kind {
        OperationKind::Copy | OperationKind::Move => {
            let Some(destination) = ctx.task.request.destination.as_deref() else {
                return Err(ItemStop::Halted);
            };
            let target = destination.join(item_name(&item.path).as_str());
            if ctx.task.request.kind == OperationKind::Copy {
                copy::copy_item(ctx, &item, target, report).await?;
            } else {
                move_op::move_item(ctx, &item, target, report).await?;
            }
        }
        OperationKind::Delete => delete::delete_item(ctx, &item, report).await?,
    }
    Ok(folder)
}

/// Pick the terminal result and make sure a failure explains itself.
fn conclude(task: &TaskShared) -> ResultCode {
    let code = if task.cancel.is_cancelled() {
        ResultCode::Cancelled
    } else if let Some(code) = task.abort_code() {
        code
    } else if task.halt.is_cancelled() {
        ResultCode::Aborted
    } else if task.is_partial() {
        ResultCode::PartialCopy
    } else {
        ResultCode::Success
    };

    if code == ResultCode::Cancelled {
        task.record(TaskIssue::warning(
            IssueKind::Cancelled,
            None,
            "Cancelled by the user",
            code,
        ));
    }
    if !code.is_success() && !task.has_issues() {
        warn!(task = %task.id, result = %code, "task ended without recorded issues");
        task.record(TaskIssue::error(
            IssueKind::Failed,
            None,
            format!("Task ended with {code}"),
            code,
        ));
    }
    code
}

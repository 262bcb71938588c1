//! The orchestrator: starts tasks, arbitrates the queue and keeps summaries.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twinpane_core::{EngineConfig, ResultCode, TaskId, TaskIdGenerator};

use crate::context::EngineContext;
use crate::diagnostics::{DiagnosticsError, TaskSummary};
use crate::events::{EventHub, TaskEvent};
use crate::executor::{self, RunEnv};
use crate::gate::Signal;
use crate::informational::{InformationalId, InformationalTask};
use crate::operation::{OperationRequest, RequestError};
use crate::queue::QueueArbiter;
use crate::task::{Task, TaskParts, TaskShared};

#[derive(Debug, Default)]
struct Registry {
    /// Live tasks in start order.
    live: IndexMap<TaskId, Task>,
    /// Oldest first, capped at `max_retained_summaries`.
    completed: VecDeque<TaskSummary>,
    informational: IndexMap<InformationalId, InformationalTask>,
}

#[derive(Debug)]
struct StateInner {
    ctx: EngineContext,
    ids: TaskIdGenerator,
    registry: Mutex<Registry>,
    arbiter: Arc<QueueArbiter>,
    signal: Arc<Signal>,
    precalc_slots: Arc<Semaphore>,
    shared_budget: Arc<Semaphore>,
    events: Arc<EventHub>,
    auto_dismiss: AtomicBool,
    shutdown: CancellationToken,
}

/// Runs copy, move and delete tasks on the context's runtime.
///
/// Cheap to clone; all clones drive the same engine. Every method is
/// synchronous and may be called from any thread.
#[derive(Debug, Clone)]
pub struct FileOperationState {
    inner: Arc<StateInner>,
}

/// Whether a finished task may be dropped without keeping its summary.
fn dismissible(result: ResultCode) -> bool {
    result.is_success() || result.is_cancelled()
}

impl FileOperationState {
    pub fn new(ctx: EngineContext) -> Self {
        let config = ctx.config().clone();
        let signal = Arc::new(Signal::new());
        Self {
            inner: Arc::new(StateInner {
                ids: TaskIdGenerator::new(),
                registry: Mutex::new(Registry::default()),
                arbiter: Arc::new(QueueArbiter::new(config.wait_for_others, signal.clone())),
                signal,
                precalc_slots: Arc::new(Semaphore::new(config.max_concurrent_precalc.max(1))),
                shared_budget: Arc::new(Semaphore::new(config.shared_item_budget.max(1))),
                events: Arc::new(EventHub::new()),
                auto_dismiss: AtomicBool::new(config.auto_dismiss_success),
                shutdown: CancellationToken::new(),
                ctx,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.ctx.config()
    }

    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    /// Validate `request` and start it as a new task.
    ///
    /// A rejected request creates no task and touches no backend.
    pub fn start_operation(&self, request: OperationRequest) -> Result<Task, RequestError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RequestError::ShuttingDown);
        }
        if let Err(err) = request.validate() {
            warn!(kind = %request.kind, error = %err, "operation rejected");
            return Err(err);
        }

        let config = inner.ctx.config();
        let id = inner.ids.next_id();
        let shared = Arc::new(TaskShared::new(TaskParts {
            id,
            concurrency: config.concurrency_for(request.kind, request.flags),
            max_issues: config.max_issues_per_task,
            cancel: inner.shutdown.child_token(),
            arbiter: inner.arbiter.clone(),
            signal: inner.signal.clone(),
            events: inner.events.clone(),
            request,
        }));
        let task = Task::new(shared.clone());

        inner
            .arbiter
            .enqueue(id, shared.request.wait_for_others);
        inner.registry.lock().live.insert(id, task.clone());
        info!(task = %id, kind = %shared.request.kind, sources = shared.request.sources.len(), "operation started");

        let env = RunEnv {
            config: config.clone(),
            precalc_slots: inner.precalc_slots.clone(),
            shared_budget: inner.shared_budget.clone(),
        };
        let state = self.clone();
        inner.ctx.handle().spawn(async move {
            let code = executor::run(shared.clone(), env).await;
            state.finish_task(&shared, code);
        });

        Ok(task)
    }

    fn finish_task(&self, shared: &TaskShared, code: ResultCode) {
        let inner = &self.inner;
        inner.arbiter.remove(shared.id);

        let summary = shared.summary(code);
        if let Some(log) = inner.ctx.diagnostics_log() {
            if let Err(err) = log.append(&summary) {
                warn!(task = %shared.id, error = %err, "failed to append to the operations log");
            }
        }

        {
            let mut registry = inner.registry.lock();
            registry.live.shift_remove(&shared.id);
            if !(inner.auto_dismiss.load(Ordering::SeqCst) && dismissible(code)) {
                registry.completed.push_back(summary);
                let cap = inner.ctx.config().max_retained_summaries.max(1);
                while registry.completed.len() > cap {
                    registry.completed.pop_front();
                }
            }
        }

        shared.finish(code);
        shared.emit(TaskEvent::Completed {
            id: shared.id,
            result: code,
        });
    }

    /// A live task.
    pub fn find_task(&self, id: TaskId) -> Option<Task> {
        self.inner.registry.lock().live.get(&id).cloned()
    }

    /// The retained summary of a finished task.
    pub fn find_summary(&self, id: TaskId) -> Option<TaskSummary> {
        self.inner
            .registry
            .lock()
            .completed
            .iter()
            .find(|summary| summary.id == id)
            .cloned()
    }

    /// Append a snapshot of the live tasks, oldest first.
    pub fn collect_tasks(&self, out: &mut Vec<Task>) {
        out.extend(self.inner.registry.lock().live.values().cloned());
    }

    /// Append a snapshot of the retained summaries, oldest first.
    pub fn collect_completed_tasks(&self, out: &mut Vec<TaskSummary>) {
        out.extend(self.inner.registry.lock().completed.iter().cloned());
    }

    /// Switch between "wait" (one task at a time) and parallel mode.
    pub fn apply_queue_mode(&self, wait_for_others: bool) {
        if self.inner.arbiter.set_wait_mode(wait_for_others) {
            info!(wait_for_others, "queue mode changed");
        }
    }

    pub fn queue_mode(&self) -> bool {
        self.inner.arbiter.wait_mode()
    }

    /// Enabling also drops the retained summaries that qualify.
    pub fn set_auto_dismiss_success(&self, enabled: bool) {
        self.inner.auto_dismiss.store(enabled, Ordering::SeqCst);
        if enabled {
            let mut registry = self.inner.registry.lock();
            let before = registry.completed.len();
            registry.completed.retain(|summary| !dismissible(summary.result));
            debug!(dismissed = before - registry.completed.len(), "auto-dismiss enabled");
        }
    }

    pub fn auto_dismiss_success(&self) -> bool {
        self.inner.auto_dismiss.load(Ordering::SeqCst)
    }

    pub fn create_or_update_informational_task(&self, card: InformationalTask) {
        self.inner
            .registry
            .lock()
            .informational
            .insert(card.id, card);
    }

    pub fn dismiss_informational_task(&self, id: InformationalId) -> bool {
        self.inner
            .registry
            .lock()
            .informational
            .shift_remove(&id)
            .is_some()
    }

    pub fn informational_tasks(&self) -> Vec<InformationalTask> {
        self.inner
            .registry
            .lock()
            .informational
            .values()
            .cloned()
            .collect()
    }

    /// Task events from now on. The stream ends at [`Self::shutdown`].
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Write a finished task's issues report and return its path.
    ///
    /// `out` defaults to a fresh file in the configured report directory.
    pub fn export_task_issues_report(
        &self,
        id: TaskId,
        out: Option<&Path>,
        open_after_export: bool,
    ) -> Result<PathBuf, DiagnosticsError> {
        let summary = match self.find_summary(id) {
            Some(summary) => summary,
            None if self.find_task(id).is_some() => {
                return Err(DiagnosticsError::TaskStillRunning { id });
            }
            None => return Err(DiagnosticsError::UnknownTask { id }),
        };

        let path = match out {
            Some(path) => path.to_path_buf(),
            None => self
                .config()
                .report_dir
                .join(summary.report_file_name()),
        };
        summary.write_report(&path)?;
        info!(task = %id, path = %path.display(), "issues report exported");

        if open_after_export {
            if let Err(err) = open::that_detached(&path) {
                warn!(path = %path.display(), error = %err, "could not open issues report");
            }
        }
        Ok(path)
    }

    /// Stop accepting work and cancel every live task.
    ///
    /// No event is delivered once this returns; running tasks wind down on
    /// their own and still record their summaries.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.events.close();
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();

        let mut live = Vec::new();
        self.collect_tasks(&mut live);
        info!(live = live.len(), "shutting down");
        for task in live {
            task.request_cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

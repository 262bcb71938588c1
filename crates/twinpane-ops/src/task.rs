//! Task handle and lifecycle state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use twinpane_core::{FsResult, OperationFlags, OperationKind, ResultCode, TaskId};

use crate::conflict::ConflictAction;
use crate::diagnostics::{IssueKind, TaskDiagnostics, TaskIssue, TaskSummary};
use crate::events::{EventHub, TaskEvent};
use crate::gate::Gate;
use crate::limiter::SpeedLimiter;
use crate::operation::OperationRequest;
use crate::precalc::PreCalcTotals;
use crate::progress::{ProgressCounters, ProgressSnapshot};
use crate::prompt::{Answer, ConflictPrompt, ConflictRequest, PromptBoard, PromptError, Ticket};
use crate::scheduler::ItemScheduler;

/// Lifecycle phase as shown to the UI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum TaskPhase {
    /// Waiting to start sizing.
    Queued,
    PreCalculating,
    /// Held back by the orchestrator until its queue turn.
    QueuePaused,
    Running,
    /// Paused by the user.
    Paused,
    /// Waiting for a conflict decision.
    Prompting,
    /// Finished with success or partial success.
    Completed,
    Cancelled,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn for_result(code: ResultCode) -> Self {
        if code.is_completed() {
            Self::Completed
        } else if code.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Failed
        }
    }
}

/// Where the runner currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Queued,
    PreCalculating,
    Running,
}

/// State shared between a [`Task`] handle, its runner and the orchestrator.
#[derive(Debug)]
pub(crate) struct TaskShared {
    pub id: TaskId,
    pub request: OperationRequest,
    pub created_at: DateTime<Utc>,
    pub gate: Gate,
    /// User cancellation; child of the orchestrator's shutdown token.
    pub cancel: CancellationToken,
    /// Stops all work: cancellation or an abort.
    pub halt: CancellationToken,
    pub precalc_skip: CancellationToken,
    pub prompts: PromptBoard,
    pub progress: Mutex<ProgressCounters>,
    pub limiter: SpeedLimiter,
    pub scheduler: ItemScheduler,
    precalc: Mutex<PreCalcTotals>,
    diagnostics: Mutex<TaskDiagnostics>,
    stage: Mutex<Stage>,
    abort_code: Mutex<Option<ResultCode>>,
    started: AtomicBool,
    /// Some item was skipped, failed or only partly done.
    partial: AtomicBool,
    result: watch::Sender<Option<ResultCode>>,
    last_phase: Mutex<Option<TaskPhase>>,
    events: Arc<EventHub>,
}

/// Parts the orchestrator wires into a new task.
pub(crate) struct TaskParts {
    pub id: TaskId,
    pub request: OperationRequest,
    pub cancel: CancellationToken,
    pub concurrency: usize,
    pub max_issues: usize,
    pub arbiter: Arc<crate::queue::QueueArbiter>,
    pub signal: Arc<crate::gate::Signal>,
    pub events: Arc<EventHub>,
}

impl TaskShared {
    pub fn new(parts: TaskParts) -> Self {
        let halt = parts.cancel.child_token();
        let total_items = parts.request.sources.len() as u64;
        let speed_limit = parts.request.speed_limit;
        let (result, _) = watch::channel(None);

        Self {
            id: parts.id,
            gate: Gate::new(parts.id, halt.clone(), parts.arbiter, parts.signal),
            request: parts.request,
            created_at: Utc::now(),
            cancel: parts.cancel,
            halt,
            precalc_skip: CancellationToken::new(),
            prompts: PromptBoard::new(),
            progress: Mutex::new(ProgressCounters::new(total_items)),
            limiter: SpeedLimiter::new(speed_limit),
            scheduler: ItemScheduler::new(parts.concurrency),
            precalc: Mutex::new(PreCalcTotals::default()),
            diagnostics: Mutex::new(TaskDiagnostics::new(parts.max_issues)),
            stage: Mutex::new(Stage::Queued),
            abort_code: Mutex::new(None),
            started: AtomicBool::new(false),
            partial: AtomicBool::new(false),
            result,
            last_phase: Mutex::new(None),
            events: parts.events,
        }
    }

    pub fn result(&self) -> Option<ResultCode> {
        *self.result.borrow()
    }

    pub fn phase(&self) -> TaskPhase {
        if let Some(code) = self.result() {
            return TaskPhase::for_result(code);
        }
        if self.cancel.is_cancelled() {
            return TaskPhase::Cancelled;
        }
        let stage = *self.stage.lock();
        if stage == Stage::Queued {
            return TaskPhase::Queued;
        }
        if self.gate.is_queue_blocked() {
            TaskPhase::QueuePaused
        } else if self.gate.is_paused() {
            TaskPhase::Paused
        } else if stage == Stage::Running && self.prompts.has_active() {
            TaskPhase::Prompting
        } else if stage == Stage::Running {
            TaskPhase::Running
        } else {
            TaskPhase::PreCalculating
        }
    }

    /// Emit `PhaseChanged` if the phase differs from the last one sent.
    pub fn publish_phase(&self) {
        let phase = self.phase();
        let changed = {
            let mut last = self.last_phase.lock();
            if *last == Some(phase) {
                false
            } else {
                *last = Some(phase);
                true
            }
        };
        if changed {
            debug!(task = %self.id, %phase, "phase changed");
            self.emit(TaskEvent::PhaseChanged { id: self.id, phase });
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        self.events.emit(event);
    }

    pub fn set_stage(&self, stage: Stage) {
        *self.stage.lock() = stage;
        self.publish_phase();
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn mark_partial(&self) {
        self.partial.store(true, Ordering::SeqCst);
    }

    pub fn is_partial(&self) -> bool {
        self.partial.load(Ordering::SeqCst)
    }

    /// Checkpoint for async code: returns once the task may run.
    pub async fn checkpoint(&self) -> FsResult<()> {
        self.gate.pass(&|| self.publish_phase()).await
    }

    /// Checkpoint for code on the blocking pool.
    pub fn checkpoint_blocking(&self) -> FsResult<()> {
        self.gate.pass_blocking(&|| self.publish_phase())
    }

    pub fn update_precalc(&self, f: impl FnOnce(&mut PreCalcTotals)) {
        f(&mut self.precalc.lock());
    }

    pub fn precalc(&self) -> PreCalcTotals {
        *self.precalc.lock()
    }

    pub fn record(&self, issue: TaskIssue) {
        self.diagnostics.lock().push(issue);
    }

    pub fn has_issues(&self) -> bool {
        !self.diagnostics.lock().is_empty()
    }

    /// Every step is idempotent, so a shutdown that already cancelled the
    /// parent token still releases the queue slot and pending prompts.
    pub fn request_cancel(&self) {
        if self.result().is_some() {
            return;
        }
        if !self.cancel.is_cancelled() {
            info!(task = %self.id, "cancel requested");
            self.cancel.cancel();
        }
        self.gate.arbiter().remove(self.id);
        self.gate.wake();
        let resolved = self.prompts.cancel_all();
        self.announce_resolved(&resolved);
        self.publish_phase();
    }

    /// Stop the task with a terminal code of its own.
    pub fn abort_with(&self, code: ResultCode) {
        {
            let mut abort = self.abort_code.lock();
            if abort.is_some() {
                return;
            }
            *abort = Some(code);
        }
        info!(task = %self.id, %code, "task aborted");
        self.halt.cancel();
        self.gate.wake();
        let resolved = self.prompts.cancel_all();
        self.announce_resolved(&resolved);
    }

    pub fn abort_code(&self) -> Option<ResultCode> {
        *self.abort_code.lock()
    }

    pub fn skip_pre_calculation(&self) {
        if self.precalc().in_progress {
            self.precalc_skip.cancel();
            self.gate.wake();
        }
    }

    /// Decide a conflict for one item.
    ///
    /// Interactive tasks ask the user; others resolve from their flags.
    pub async fn resolve_conflict(&self, request: ConflictRequest) -> Answer {
        if !self.request.require_confirmation {
            if self.request.flags.contains(OperationFlags::CONTINUE_ON_ERROR) {
                return Answer {
                    action: ConflictAction::Skip,
                    from_cache: false,
                };
            }
            let code = request.bucket.abort_code();
            self.record(TaskIssue::error(
                IssueKind::Aborted,
                Some(&request.source),
                request.message,
                code,
            ));
            self.abort_with(code);
            return Answer {
                action: ConflictAction::Cancel,
                from_cache: false,
            };
        }

        match self.prompts.request(request) {
            Ticket::Ready(answer) => answer,
            Ticket::Waiting { reply, raised } => {
                if let Some(prompt) = raised {
                    self.announce_prompt(prompt);
                }
                tokio::select! {
                    answer = reply => answer.unwrap_or(Answer {
                        action: ConflictAction::Cancel,
                        from_cache: false,
                    }),
                    _ = self.halt.cancelled() => Answer {
                        action: ConflictAction::Cancel,
                        from_cache: false,
                    },
                }
            }
        }
    }

    pub fn submit_conflict_decision(
        &self,
        action: ConflictAction,
        apply_to_all: bool,
    ) -> Result<(), PromptError> {
        let submitted = self.prompts.submit(action, apply_to_all)?;
        debug!(task = %self.id, %action, apply_to_all, "conflict decided");
        self.announce_resolved(&submitted.resolved);
        if let Some(next) = submitted.next {
            self.announce_prompt(next);
        }
        if action == ConflictAction::Cancel {
            self.request_cancel();
        }
        self.publish_phase();
        Ok(())
    }

    fn announce_prompt(&self, prompt: ConflictPrompt) {
        info!(task = %self.id, prompt = prompt.id, bucket = %prompt.bucket, path = %prompt.source.display(), "conflict prompt raised");
        self.emit(TaskEvent::PromptRaised {
            id: self.id,
            prompt,
        });
        self.publish_phase();
    }

    fn announce_resolved(&self, resolved: &[(u64, ConflictAction)]) {
        for &(prompt_id, action) in resolved {
            self.emit(TaskEvent::PromptResolved {
                id: self.id,
                prompt_id,
                action,
            });
        }
    }

    /// Record the terminal result. The first call wins.
    pub fn finish(&self, code: ResultCode) {
        let mut first = false;
        self.result.send_if_modified(|result| {
            if result.is_none() {
                *result = Some(code);
                first = true;
            }
            first
        });
        if first {
            self.publish_phase();
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let phase = self.phase();
        let mut snapshot = ProgressSnapshot::from_counters(&self.progress.lock(), phase);
        snapshot.in_flight_items = self.scheduler.in_flight();
        snapshot.pre_calc = self.precalc();
        snapshot.desired_speed_limit = self.limiter.desired();
        snapshot.effective_speed_limit = self.limiter.limit();
        let diagnostics = self.diagnostics.lock();
        snapshot.warning_count = diagnostics.warning_count();
        snapshot.error_count = diagnostics.error_count();
        snapshot
    }

    pub fn summary(&self, result: ResultCode) -> TaskSummary {
        let (total_items, completed_items, completed_bytes) = {
            let progress = self.progress.lock();
            (
                progress.total_items(),
                progress.completed_items(),
                progress.completed_bytes(),
            )
        };
        let diagnostics = self.diagnostics.lock();
        TaskSummary {
            id: self.id,
            kind: self.request.kind,
            flags: self.request.flags,
            sources: self.request.sources.clone(),
            destination: self.request.destination.clone(),
            source_pane: self.request.source_pane,
            destination_pane: self.request.destination_pane,
            result,
            warning_count: diagnostics.warning_count(),
            error_count: diagnostics.error_count(),
            issues: diagnostics.issues().to_vec(),
            dropped_issues: diagnostics.dropped(),
            total_items,
            completed_items,
            completed_bytes,
            started_at: self.created_at,
            finished_at: Utc::now(),
        }
    }

    fn issues(&self) -> Vec<TaskIssue> {
        self.diagnostics.lock().issues().to_vec()
    }

    fn counts(&self) -> (u64, u64) {
        let diagnostics = self.diagnostics.lock();
        (diagnostics.warning_count(), diagnostics.error_count())
    }
}

/// Handle to a running or finished task.
///
/// Cheap to clone; every clone controls the same task.
#[derive(Debug, Clone)]
pub struct Task {
    shared: Arc<TaskShared>,
}

impl Task {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.request.kind
    }

    pub fn request(&self) -> &OperationRequest {
        &self.shared.request
    }

    pub fn phase(&self) -> TaskPhase {
        self.shared.phase()
    }

    pub fn is_interactive(&self) -> bool {
        self.shared.request.require_confirmation
    }

    /// Cancel the task. Idempotent; takes effect at the next checkpoint and
    /// frees the task's queue slot right away.
    pub fn request_cancel(&self) {
        self.shared.request_cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Flip the user pause; returns whether the task is now paused.
    pub fn toggle_pause(&self) -> bool {
        let paused = self.shared.gate.toggle_pause();
        info!(task = %self.shared.id, paused, "pause toggled");
        self.shared.publish_phase();
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.shared.gate.is_paused()
    }

    pub fn is_queue_paused(&self) -> bool {
        self.shared.gate.is_queue_blocked()
    }

    /// Bytes per second for the next chunks; 0 removes the limit.
    pub fn set_desired_speed_limit(&self, bytes_per_second: u64) {
        self.shared.limiter.set_limit(bytes_per_second);
        debug!(task = %self.shared.id, bytes_per_second, effective = self.shared.limiter.limit(), "speed limit changed");
    }

    pub fn desired_speed_limit(&self) -> u64 {
        self.shared.limiter.desired()
    }

    pub fn effective_speed_limit(&self) -> u64 {
        self.shared.limiter.limit()
    }

    /// Stop sizing the sources; the transfer proceeds on item counts.
    pub fn skip_pre_calculation(&self) {
        self.shared.skip_pre_calculation();
    }

    pub fn pre_calc(&self) -> PreCalcTotals {
        self.shared.precalc()
    }

    pub fn submit_conflict_decision(
        &self,
        action: ConflictAction,
        apply_to_all: bool,
    ) -> Result<(), PromptError> {
        self.shared.submit_conflict_decision(action, apply_to_all)
    }

    pub fn active_prompt(&self) -> Option<ConflictPrompt> {
        self.shared.prompts.active()
    }

    /// Whether the task got past sizing and its first queue checkpoint.
    pub fn has_started(&self) -> bool {
        self.shared.has_started()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.shared.snapshot()
    }

    pub fn in_flight_item_count(&self) -> usize {
        self.shared.scheduler.in_flight()
    }

    /// Highest number of items that were in flight at once.
    pub fn peak_in_flight_item_count(&self) -> usize {
        self.shared.scheduler.peak()
    }

    pub fn warning_count(&self) -> u64 {
        self.shared.counts().0
    }

    pub fn error_count(&self) -> u64 {
        self.shared.counts().1
    }

    pub fn issues(&self) -> Vec<TaskIssue> {
        self.shared.issues()
    }

    /// Terminal result, once the runner finished.
    pub fn result(&self) -> Option<ResultCode> {
        self.shared.result()
    }

    /// Wait for the terminal result.
    pub async fn wait(&self) -> ResultCode {
        let mut result = self.shared.result.subscribe();
        let code = result.wait_for(Option::is_some).await.ok().and_then(|r| *r);
        code.unwrap_or(ResultCode::Aborted)
    }
}

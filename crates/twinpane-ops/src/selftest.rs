//! Self-test harness.
//!
//! A suite is a list of named async steps. Steps run one after another,
//! each under its own timeout, and the harness reports pass/fail with the
//! elapsed time. [`builtin_suite`] checks the engine's core guarantees
//! against in-memory backends.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{info, warn};

use twinpane_core::{EngineConfig, FsError, LinkKind, ReparsePolicy, ResultCode};
use twinpane_vfs::{DirectoryReader, FileSystem, InMemoryFileSystem, WalkControl};

use crate::conflict::{ConflictAction, ConflictBucket};
use crate::context::EngineContext;
use crate::events::TaskEvent;
use crate::operation::{OperationRequest, RequestError};
use crate::state::FileOperationState;
use crate::task::Task;

/// Interval between two evaluations in [`wait_until`].
const POLL: Duration = Duration::from_millis(10);

/// Why a step failed.
#[derive(Debug, Error)]
pub enum SelfTestError {
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Check failed: {0}")]
    Check(String),

    #[error("Request rejected: {0}")]
    Request(#[from] RequestError),

    #[error("Backend error: {0}")]
    Fs(#[from] FsError),
}

pub type StepResult = Result<(), SelfTestError>;
pub type StepFuture = Pin<Box<dyn Future<Output = StepResult> + Send>>;

/// What every step gets: the runtime and a base configuration.
#[derive(Debug, Clone)]
pub struct SelfTestEnv {
    pub config: EngineConfig,
    pub handle: Handle,
}

impl SelfTestEnv {
    pub fn new(config: EngineConfig, handle: Handle) -> Self {
        Self { config, handle }
    }

    /// A fresh orchestrator with `tweak` applied to the base config.
    pub fn state(&self, tweak: impl FnOnce(&mut EngineConfig)) -> FileOperationState {
        let mut config = self.config.clone();
        tweak(&mut config);
        FileOperationState::new(EngineContext::new(config, self.handle.clone()))
    }
}

struct SelfTestStep {
    name: String,
    timeout: Duration,
    run: Box<dyn Fn(SelfTestEnv) -> StepFuture + Send + Sync>,
}

/// Ordered list of steps.
#[derive(Default)]
pub struct SelfTestSuite {
    steps: Vec<SelfTestStep>,
}

/// Result of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub name: String,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelfTestReport {
    pub outcomes: Vec<StepOutcome>,
}

impl SelfTestReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(StepOutcome::passed)
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed()).count()
    }

    /// One line per step.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for outcome in &self.outcomes {
            let status = if outcome.passed() { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "{status} {:<40} {:>8.2?}",
                outcome.name, outcome.elapsed
            ));
            if let Some(error) = &outcome.error {
                out.push_str(&format!("  {error}"));
            }
            out.push('\n');
        }
        out
    }
}

impl SelfTestSuite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, timeout: Duration, run: F) -> Self
    where
        F: Fn(SelfTestEnv) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        self.steps.push(SelfTestStep {
            name: name.into(),
            timeout,
            run: Box::new(move |env| Box::pin(run(env))),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.name.as_str())
    }

    /// Run every step in order.
    pub async fn run(&self, env: &SelfTestEnv) -> SelfTestReport {
        let mut report = SelfTestReport::default();
        for step in &self.steps {
            let started = Instant::now();
            let result = match tokio::time::timeout(step.timeout, (step.run)(env.clone())).await
            {
                Ok(result) => result,
                Err(_) => Err(SelfTestError::TimedOut(step.timeout)),
            };
            let elapsed = started.elapsed();
            match &result {
                Ok(()) => info!(step = %step.name, ?elapsed, "self-test step passed"),
                Err(err) => warn!(step = %step.name, ?elapsed, error = %err, "self-test step failed"),
            }
            report.outcomes.push(StepOutcome {
                name: step.name.clone(),
                elapsed,
                error: result.err().map(|err| err.to_string()),
            });
        }
        report
    }
}

/// Poll `condition` until it holds.
pub async fn wait_until(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> StepResult {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return Err(SelfTestError::TimedOut(timeout));
        }
        tokio::time::sleep(POLL).await;
    }
    Ok(())
}

/// Fail the step with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl Into<String>) -> StepResult {
    if condition {
        Ok(())
    } else {
        Err(SelfTestError::Check(message.into()))
    }
}

fn expect_result(task: &Task, got: ResultCode, want: ResultCode) -> StepResult {
    ensure(
        got == want,
        format!("task {} ended with {got}, expected {want}", task.id()),
    )
}

const SHORT: Duration = Duration::from_secs(5);

/// The engine's core guarantees as a runnable suite.
pub fn builtin_suite() -> SelfTestSuite {
    SelfTestSuite::new()
        .step("queue slot released on cancel", Duration::from_secs(20), queue_slot_released)
        .step("pre-calculation skip", Duration::from_secs(20), precalc_skip)
        .step("concurrency knob", Duration::from_secs(20), concurrency_knob)
        .step("apply-to-all caching", Duration::from_secs(20), apply_to_all)
        .step("partial copy accounting", Duration::from_secs(20), partial_copy)
        .step("single-file sizing", Duration::from_secs(5), single_file_sizing)
        .step("link skipped on cross-backend move", Duration::from_secs(20), link_skip)
}

fn memory(name: &str) -> InMemoryFileSystem {
    InMemoryFileSystem::new(name)
}

async fn queue_slot_released(env: SelfTestEnv) -> StepResult {
    let state = env.state(|_| {});
    state.apply_queue_mode(true);
    let fs = memory("queue");
    fs.add_synthetic_file("/src/big.bin", 4 * 1024 * 1024)?;
    fs.add_file("/src/b.txt", b"second".to_vec())?;
    fs.add_file("/src/c.txt", b"third".to_vec())?;
    let fs: Arc<dyn FileSystem> = Arc::new(fs);

    let first = state.start_operation(
        OperationRequest::copy(fs.clone(), vec!["/src/big.bin".into()], "/one")
            .with_speed_limit(64 * 1024),
    )?;
    wait_until(SHORT, || first.has_started()).await?;
    first.toggle_pause();

    let second =
        state.start_operation(OperationRequest::copy(fs.clone(), vec!["/src/b.txt".into()], "/two"))?;
    let third =
        state.start_operation(OperationRequest::copy(fs.clone(), vec!["/src/c.txt".into()], "/three"))?;
    wait_until(SHORT, || second.is_queue_paused() && third.is_queue_paused()).await?;

    second.request_cancel();
    expect_result(&second, second.wait().await, ResultCode::Cancelled)?;
    first.request_cancel();
    expect_result(&first, first.wait().await, ResultCode::Cancelled)?;
    expect_result(&third, third.wait().await, ResultCode::Success)?;

    state.shutdown();
    Ok(())
}

async fn precalc_skip(env: SelfTestEnv) -> StepResult {
    let state = env.state(|_| {});
    let fs = memory("sizing").with_latency(Duration::from_millis(5));
    for i in 0..200 {
        fs.add_file(format!("/src/tree/d{i}/f.txt"), b"x".to_vec())?;
    }
    let fs: Arc<dyn FileSystem> = Arc::new(fs);

    let task =
        state.start_operation(OperationRequest::copy(fs, vec!["/src/tree".into()], "/dst"))?;
    wait_until(SHORT, || task.pre_calc().in_progress).await?;
    task.skip_pre_calculation();
    wait_until(SHORT, || task.has_started()).await?;

    let totals = task.pre_calc();
    ensure(totals.skipped, "sizing not marked skipped")?;
    ensure(!totals.completed, "sizing marked completed after a skip")?;

    task.request_cancel();
    task.wait().await;
    state.shutdown();
    Ok(())
}

async fn concurrency_knob(env: SelfTestEnv) -> StepResult {
    for (limit, files) in [(1usize, 6usize), (8, 16)] {
        let state = env.state(|config| config.copy_move_max_concurrency = limit);
        let fs = memory("knob").with_latency(Duration::from_millis(5));
        let mut sources = Vec::new();
        for i in 0..files {
            let path = format!("/src/f{i}.bin");
            fs.add_synthetic_file(&path, 256 * 1024)?;
            sources.push(path.into());
        }
        let fs: Arc<dyn FileSystem> = Arc::new(fs);

        let task = state.start_operation(OperationRequest::copy(fs, sources, "/dst"))?;
        expect_result(&task, task.wait().await, ResultCode::Success)?;

        let peak = task.peak_in_flight_item_count();
        if limit == 1 {
            ensure(peak == 1, format!("limit 1 reached {peak} items in flight"))?;
        } else {
            ensure(peak > 1, format!("limit {limit} never ran items in parallel"))?;
        }
        state.shutdown();
    }
    Ok(())
}

/// Answer the next prompt of `task` with `action`.
async fn answer(task: &Task, action: ConflictAction, apply_to_all: bool) -> StepResult {
    wait_until(SHORT, || task.active_prompt().is_some()).await?;
    task.submit_conflict_decision(action, apply_to_all)
        .map_err(|err| SelfTestError::Check(err.to_string()))
}

async fn apply_to_all(env: SelfTestEnv) -> StepResult {
    let state = env.state(|config| config.copy_move_max_concurrency = 1);
    let fs = memory("overwrite");
    let mut sources = Vec::new();
    for i in 0..5 {
        fs.add_file(format!("/src/f{i}.txt"), b"new".to_vec())?;
        fs.add_file(format!("/dst/f{i}.txt"), b"old contents".to_vec())?;
        sources.push(format!("/src/f{i}.txt").into());
    }
    let probe = fs.clone();
    let fs: Arc<dyn FileSystem> = Arc::new(fs);
    let mut events = state.subscribe();

    let task = state.start_operation(
        OperationRequest::copy(fs, sources, "/dst").require_confirmation(true),
    )?;
    answer(&task, ConflictAction::Overwrite, true).await?;
    expect_result(&task, task.wait().await, ResultCode::Success)?;

    let mut raised = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TaskEvent::PromptRaised { .. }) {
            raised += 1;
        }
    }
    ensure(raised == 1, format!("{raised} prompts raised, expected 1"))?;
    for i in 0..5 {
        ensure(
            probe.read_file(format!("/dst/f{i}.txt"))? == b"new",
            format!("f{i}.txt not overwritten"),
        )?;
    }
    state.shutdown();
    Ok(())
}

async fn partial_copy(env: SelfTestEnv) -> StepResult {
    let state = env.state(|_| {});
    let fs = memory("partial");
    fs.add_file("/src/tree/a.txt", vec![1; 10])?;
    fs.add_file("/src/tree/b.txt", vec![2; 20])?;
    fs.add_file("/src/tree/sub/c.txt", vec![3; 30])?;
    fs.add_file("/dst/tree/b.txt", b"keep".to_vec())?;
    let probe = fs.clone();
    let fs: Arc<dyn FileSystem> = Arc::new(fs);

    let task = state.start_operation(
        OperationRequest::copy(fs, vec!["/src/tree".into()], "/dst").require_confirmation(true),
    )?;
    answer(&task, ConflictAction::Skip, false).await?;
    expect_result(&task, task.wait().await, ResultCode::PartialCopy)?;

    ensure(probe.file_size("/dst/tree/a.txt") == Some(10), "a.txt missing")?;
    ensure(probe.file_size("/dst/tree/sub/c.txt") == Some(30), "c.txt missing")?;
    ensure(probe.read_file("/dst/tree/b.txt")? == b"keep", "skipped file changed")?;
    ensure(task.warning_count() > 0, "skip left no diagnostics")?;
    state.shutdown();
    Ok(())
}

async fn single_file_sizing(_env: SelfTestEnv) -> StepResult {
    let fs = memory("size");
    fs.add_synthetic_file("/file.bin", 12_345)?;
    let totals = fs.get_directory_size(Path::new("/file.bin"), &WalkControl::none())?;
    ensure(
        (totals.total_bytes, totals.file_count, totals.directory_count) == (12_345, 1, 0),
        format!("unexpected totals {totals:?}"),
    )
}

async fn link_skip(env: SelfTestEnv) -> StepResult {
    let state = env.state(|config| config.reparse_policy = ReparsePolicy::Skip);
    let source = memory("links");
    source.add_link("/src/junction", LinkKind::Junction, "/outside")?;
    let destination = memory("plain").with_link_support(false);
    let probe = source.clone();

    let task = state.start_operation(
        OperationRequest::move_to(Arc::new(source), vec!["/src/junction".into()], "/dst")
            .with_destination_file_system(Arc::new(destination))
            .require_confirmation(true),
    )?;
    wait_until(SHORT, || task.active_prompt().is_some()).await?;
    let Some(prompt) = task.active_prompt() else {
        return Err(SelfTestError::Check("prompt vanished".into()));
    };
    ensure(
        prompt.bucket == ConflictBucket::UnsupportedReparse,
        format!("unexpected bucket {}", prompt.bucket),
    )?;
    ensure(
        prompt.actions
            == [ConflictAction::Skip, ConflictAction::SkipAll, ConflictAction::Cancel],
        format!("unexpected actions {:?}", prompt.actions),
    )?;
    task.submit_conflict_decision(ConflictAction::Skip, false)
        .map_err(|err| SelfTestError::Check(err.to_string()))?;
    expect_result(&task, task.wait().await, ResultCode::PartialCopy)?;
    ensure(probe.exists("/src/junction"), "source link removed")?;
    state.shutdown();
    Ok(())
}

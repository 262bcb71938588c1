//! File operations engine for twinpane.
//!
//! [`FileOperationState`] runs copy, move and delete tasks against pluggable
//! [`twinpane_vfs::FileSystem`] backends. Each task sizes its sources, waits
//! for its queue turn, fans its items out under a bounded per-item
//! scheduler and resolves recoverable conflicts through typed prompts,
//! while the UI reads progress snapshots and sends pause, cancel and
//! speed-limit commands through the [`Task`] handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twinpane_core::EngineConfig;
//! use twinpane_ops::{EngineContext, FileOperationState, OperationRequest};
//! use twinpane_vfs::LocalFileSystem;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let state = FileOperationState::new(EngineContext::current(EngineConfig::default())?);
//! let task = state.start_operation(OperationRequest::copy(
//!     Arc::new(LocalFileSystem::new()),
//!     vec!["/data/photos".into()],
//!     "/backup",
//! ))?;
//! println!("finished with {}", task.wait().await);
//! # Ok(())
//! # }
//! ```

mod conflict;
mod context;
mod copy;
mod delete;
mod diagnostics;
mod events;
mod executor;
mod gate;
mod informational;
mod item;
mod limiter;
mod move_op;
mod operation;
mod precalc;
mod progress;
mod prompt;
mod queue;
mod reparse;
mod scheduler;
pub mod selftest;
mod state;
mod task;

pub use conflict::{ConflictAction, ConflictBucket, classify, unique_name};
pub use context::{EngineContext, build_runtime};
pub use diagnostics::{
    DiagnosticsError, DiagnosticsLog, IssueKind, LOG_FILE_PREFIX, LOG_FILE_SUFFIX, Severity,
    TaskIssue, TaskSummary,
};
pub use events::{EVENT_CHANNEL_SIZE, TaskEvent};
pub use informational::{InformationalId, InformationalTask};
pub use limiter::{MIN_SPEED_LIMIT, effective_limit};
pub use operation::{OperationRequest, RequestError};
pub use precalc::PreCalcTotals;
pub use progress::ProgressSnapshot;
pub use prompt::{ConflictPrompt, PromptError};
pub use state::FileOperationState;
pub use task::{Task, TaskPhase};

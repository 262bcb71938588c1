//! Task issues, completed-task summaries, issues reports and the rotating
//! operations log.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use humansize::{BINARY, format_size};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

use twinpane_core::{OperationFlags, OperationKind, Pane, ResultCode, TaskId};

/// File name prefix of the operations log.
pub const LOG_FILE_PREFIX: &str = "operations";
/// File name suffix of the operations log.
pub const LOG_FILE_SUFFIX: &str = "jsonl";

/// Errors from diagnostics export and logging.
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("Unknown task {id}")]
    UnknownTask { id: TaskId },

    #[error("Task {id} is still running")]
    TaskStillRunning { id: TaskId },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open the operations log in {dir}: {source}")]
    Log {
        dir: PathBuf,
        #[source]
        source: InitError,
    },

    #[error("Failed to serialize diagnostics: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// What an issue is about.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum IssueKind {
    /// An item was left alone after a conflict.
    Skipped,
    /// An item failed and the task went on.
    Failed,
    /// The task stopped because of this failure.
    Aborted,
    /// Timestamps or attributes could not be carried over.
    Metadata,
    /// Sizing the sources went wrong.
    PreCalc,
    /// A source could not be removed after it was moved.
    Cleanup,
    /// The user cancelled the task.
    Cancelled,
}

/// One anomaly recorded while a task ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub path: Option<PathBuf>,
    pub message: String,
    pub code: ResultCode,
    pub at: DateTime<Utc>,
}

impl TaskIssue {
    pub fn warning(
        kind: IssueKind,
        path: Option<&Path>,
        message: impl Into<String>,
        code: ResultCode,
    ) -> Self {
        Self::new(Severity::Warning, kind, path, message, code)
    }

    pub fn error(
        kind: IssueKind,
        path: Option<&Path>,
        message: impl Into<String>,
        code: ResultCode,
    ) -> Self {
        Self::new(Severity::Error, kind, path, message, code)
    }

    fn new(
        severity: Severity,
        kind: IssueKind,
        path: Option<&Path>,
        message: impl Into<String>,
        code: ResultCode,
    ) -> Self {
        Self {
            severity,
            kind,
            path: path.map(Path::to_path_buf),
            message: message.into(),
            code,
            at: Utc::now(),
        }
    }
}

/// Issues of one task. Past the cap issues are only counted.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskDiagnostics {
    issues: Vec<TaskIssue>,
    warning_count: u64,
    error_count: u64,
    dropped: u64,
    cap: usize,
}

impl TaskDiagnostics {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    pub fn push(&mut self, issue: TaskIssue) {
        match issue.severity {
            Severity::Warning => self.warning_count += 1,
            Severity::Error => self.error_count += 1,
        }
        if self.issues.len() < self.cap {
            self.issues.push(issue);
        } else {
            self.dropped += 1;
        }
    }

    pub fn warning_count(&self) -> u64 {
        self.warning_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn is_empty(&self) -> bool {
        self.warning_count == 0 && self.error_count == 0
    }

    pub fn issues(&self) -> &[TaskIssue] {
        &self.issues
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// What is kept of a task after it finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub kind: OperationKind,
    pub flags: OperationFlags,
    pub sources: Vec<PathBuf>,
    pub destination: Option<PathBuf>,
    pub source_pane: Pane,
    pub destination_pane: Pane,
    pub result: ResultCode,
    pub warning_count: u64,
    pub error_count: u64,
    pub issues: Vec<TaskIssue>,
    /// Issues counted but not kept.
    pub dropped_issues: u64,
    pub total_items: u64,
    pub completed_items: u64,
    pub completed_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskSummary {
    pub fn hresult(&self) -> u32 {
        self.result.hresult()
    }

    /// Human-readable issues report.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        let elapsed = (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default();

        let _ = writeln!(out, "twinpane issues report");
        let _ = writeln!(out, "======================");
        let _ = writeln!(out, "Task:        {} ({})", self.id, self.kind);
        let _ = writeln!(
            out,
            "Result:      {} (0x{:08X})",
            self.result,
            self.hresult()
        );
        let _ = writeln!(out, "Flags:       {}", self.flags.describe());
        let _ = writeln!(
            out,
            "Sources:     {} ({} pane)",
            self.sources.iter().map(|p| p.display()).join(", "),
            self.source_pane
        );
        if let Some(destination) = &self.destination {
            let _ = writeln!(
                out,
                "Destination: {} ({} pane)",
                destination.display(),
                self.destination_pane
            );
        }
        let _ = writeln!(
            out,
            "Items:       {} of {} completed, {}",
            self.completed_items,
            self.total_items,
            format_size(self.completed_bytes, BINARY)
        );
        let _ = writeln!(
            out,
            "Started:     {} (took {:.1}s)",
            self.started_at.to_rfc3339(),
            elapsed.as_secs_f64()
        );
        let _ = writeln!(
            out,
            "Issues:      {} warnings, {} errors",
            self.warning_count, self.error_count
        );
        let _ = writeln!(out);

        if self.issues.is_empty() {
            let _ = writeln!(out, "No issues were recorded.");
        }
        for (index, issue) in self.issues.iter().enumerate() {
            let path = issue
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:>4}. [{}] {} {} {}: {}",
                index + 1,
                issue.severity,
                issue.at.format("%H:%M:%S%.3f"),
                issue.kind,
                path,
                issue.message
            );
            let _ = writeln!(out, "      code {}", issue.code);
        }
        if self.dropped_issues > 0 {
            let _ = writeln!(
                out,
                "... {} more issues were counted but not kept",
                self.dropped_issues
            );
        }
        out
    }

    /// Write the report to `path`, creating parent directories.
    pub fn write_report(&self, path: &Path) -> Result<(), DiagnosticsError> {
        let write_err = |source| DiagnosticsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, self.render_report()).map_err(write_err)
    }

    /// Default report file name.
    pub fn report_file_name(&self) -> String {
        format!(
            "task-{}-{}.txt",
            self.id.0,
            self.finished_at.format("%Y%m%d-%H%M%S")
        )
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    run: &'a str,
    #[serde(flatten)]
    summary: &'a TaskSummary,
}

/// Append-only JSON-lines log of completed tasks, rotated daily.
///
/// Several runs can share one day file; every record carries the run id.
pub struct DiagnosticsLog {
    writer: Mutex<RollingFileAppender>,
    run_id: String,
    dir: PathBuf,
}

impl std::fmt::Debug for DiagnosticsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsLog")
            .field("run_id", &self.run_id)
            .field("dir", &self.dir)
            .finish()
    }
}

impl DiagnosticsLog {
    pub fn new(dir: &Path, max_files: usize) -> Result<Self, DiagnosticsError> {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(max_files.max(1))
            .build(dir)
            .map_err(|source| DiagnosticsError::Log {
                dir: dir.to_path_buf(),
                source,
            })?;

        Ok(Self {
            writer: Mutex::new(appender),
            run_id: format!(
                "{}-{}",
                Utc::now().format("%Y%m%dT%H%M%S"),
                std::process::id()
            ),
            dir: dir.to_path_buf(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, summary: &TaskSummary) -> Result<(), DiagnosticsError> {
        let mut line = serde_json::to_vec(&LogRecord {
            run: &self.run_id,
            summary,
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|source| DiagnosticsError::Write {
                path: self.dir.clone(),
                source,
            })
    }
}

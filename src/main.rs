//! twinpane - file operations engine of a dual-pane file manager.
//!
//! Usage:
//!   twinpane copy <SOURCES>... --to <DIR>     Copy items into a folder
//!   twinpane move <SOURCES>... --to <DIR>     Move items into a folder
//!   twinpane delete <PATHS>...                Delete items
//!   twinpane size <PATHS>...                  Size files and folders
//!   twinpane self-test                        Run the engine self-test
//!   twinpane config                           Show the effective configuration

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use twinpane_core::{EngineConfig, ExecutionMode, OperationFlags, ResultCode, SizeTotals};
use twinpane_ops::selftest::{SelfTestEnv, builtin_suite};
use twinpane_ops::{
    ConflictAction, ConflictPrompt, DiagnosticsLog, EngineContext, FileOperationState,
    OperationRequest, ProgressSnapshot, Task, TaskEvent, build_runtime,
};
use twinpane_vfs::{FileSystem, LocalFileSystem, WalkControl};

/// Filter used when RUST_LOG is unset.
const DEFAULT_FILTER: &str = "twinpane=info,twinpane_ops=info,twinpane_vfs=info";

#[derive(Parser)]
#[command(
    name = "twinpane",
    version,
    about = "Copy, move and delete files with queued, throttled background tasks",
    long_about = "twinpane runs file operations the way its dual-pane UI does: tasks are \
                  sized first, can be queued behind each other, paused, throttled and \
                  cancelled, and ask before overwriting anything."
)]
struct Cli {
    /// Config file (defaults to the user config, if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print engine logs on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy items into a folder
    Copy {
        /// Files and folders to copy
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination folder
        #[arg(short, long)]
        to: PathBuf,

        #[command(flatten)]
        options: TaskOptions,
    },

    /// Move items into a folder
    Move {
        /// Files and folders to move
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination folder
        #[arg(short, long)]
        to: PathBuf,

        #[command(flatten)]
        options: TaskOptions,
    },

    /// Delete items
    Delete {
        /// Files and folders to delete
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Send items to the recycle bin instead
        #[arg(long)]
        recycle_bin: bool,

        #[command(flatten)]
        options: TaskOptions,
    },

    /// Total size, file and folder count of items
    Size {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the engine self-test against in-memory backends
    SelfTest,

    /// Show the effective configuration as TOML
    Config {
        /// Write the default configuration to the user config file
        #[arg(long)]
        init: bool,

        /// Overwrite an existing config file with --init
        #[arg(long, requires = "init")]
        force: bool,
    },
}

#[derive(Args, Clone)]
struct TaskOptions {
    /// Schedule every top-level item as its own job
    #[arg(long)]
    per_item: bool,

    /// Bytes per second, e.g. "512K" or "4M" (0 for unlimited)
    #[arg(long, value_parser = parse_size)]
    speed_limit: Option<u64>,

    /// Replace existing items without asking
    #[arg(long)]
    overwrite: bool,

    /// Replace or delete read-only items without asking
    #[arg(long)]
    replace_read_only: bool,

    /// Skip failing items instead of aborting the task
    #[arg(long)]
    continue_on_error: bool,

    /// Do not descend into folders
    #[arg(long)]
    no_recursive: bool,

    /// Ask on the terminal how to resolve conflicts
    #[arg(short, long)]
    interactive: bool,

    /// Queue behind every other running task
    #[arg(long)]
    wait: bool,

    /// Write an issues report when the task did not fully succeed
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    report: Option<Option<PathBuf>>,

    /// Open the report after writing it
    #[arg(long, requires = "report")]
    open_report: bool,
}

impl TaskOptions {
    fn flags(&self) -> OperationFlags {
        let mut flags = OperationFlags::standard();
        flags.set(OperationFlags::RECURSIVE, !self.no_recursive);
        flags.set(OperationFlags::ALLOW_OVERWRITE, self.overwrite);
        flags.set(OperationFlags::ALLOW_REPLACE_READONLY, self.replace_read_only);
        flags.set(OperationFlags::CONTINUE_ON_ERROR, self.continue_on_error);
        flags
    }

    fn apply(&self, request: OperationRequest) -> OperationRequest {
        let mode = if self.per_item {
            ExecutionMode::PerItem
        } else {
            ExecutionMode::BulkItems
        };
        request
            .with_flags(self.flags())
            .with_execution_mode(mode)
            .with_speed_limit(self.speed_limit.unwrap_or(0))
            .wait_for_others(self.wait)
            .require_confirmation(self.interactive)
    }
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };
    let _log_guard = init_tracing(&config, cli.verbose)?;

    match cli.command {
        Command::Copy {
            sources,
            to,
            options,
        } => {
            let request = OperationRequest::copy(local(), absolute(sources)?, absolute_one(&to)?);
            run_operation(config, options.apply(request), &options)
        }
        Command::Move {
            sources,
            to,
            options,
        } => {
            let request =
                OperationRequest::move_to(local(), absolute(sources)?, absolute_one(&to)?);
            run_operation(config, options.apply(request), &options)
        }
        Command::Delete {
            paths,
            recycle_bin,
            options,
        } => {
            let request = options.apply(OperationRequest::delete(local(), absolute(paths)?));
            let mut flags = request.flags;
            flags.set(OperationFlags::USE_RECYCLE_BIN, recycle_bin);
            run_operation(config, request.with_flags(flags), &options)
        }
        Command::Size { paths, json } => run_size(&paths, json),
        Command::SelfTest => run_self_test(config),
        Command::Config { init, force } => run_config(&config, init, force),
    }
}

fn local() -> Arc<dyn FileSystem> {
    Arc::new(LocalFileSystem::new())
}

fn absolute_one(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path {}", path.display()))
}

fn absolute(paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    paths.iter().map(|path| absolute_one(path)).collect()
}

/// Console logging for `-v`, plus a daily rolling file in the log directory.
fn init_tracing(config: &EngineConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_level);

    let appender = std::fs::create_dir_all(&config.log_dir)
        .map_err(|err| err.to_string())
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("twinpane")
                .filename_suffix("log")
                .max_log_files(config.max_log_files.max(1))
                .build(&config.log_dir)
                .map_err(|err| err.to_string())
        });

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_thread_ids(true)
                        .with_writer(writer),
                )
                .try_init()
                .map_err(|err| eyre!("Failed to initialize logging: {err}"))?;
            Ok(Some(guard))
        }
        Err(reason) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()
                .map_err(|err| eyre!("Failed to initialize logging: {err}"))?;
            warn!(dir = %config.log_dir.display(), %reason, "file logging disabled");
            Ok(None)
        }
    }
}

fn engine_context(config: EngineConfig, handle: tokio::runtime::Handle) -> EngineContext {
    let log = DiagnosticsLog::new(&config.log_dir, config.max_log_files);
    let context = EngineContext::new(config, handle);
    match log {
        Ok(log) => context.with_diagnostics_log(log),
        Err(err) => {
            warn!(error = %err, "operations log disabled");
            context
        }
    }
}

fn run_operation(
    config: EngineConfig,
    request: OperationRequest,
    options: &TaskOptions,
) -> Result<ExitCode> {
    let runtime = build_runtime(&config).context("Failed to start the runtime")?;
    let state = FileOperationState::new(engine_context(config, runtime.handle().clone()));

    let code = runtime.block_on(async {
        let mut events = state.subscribe();
        let task = state
            .start_operation(request)
            .map_err(|err| eyre!("{err} ({})", err.code()))?;
        info!(task = %task.id(), kind = %task.kind(), "started from the command line");

        let code = watch_task(&task, &mut events, options.interactive).await;
        Ok::<_, color_eyre::Report>((task, code))
    });
    let (task, code) = code?;

    print_outcome(&task, code);
    if let Some(out) = &options.report {
        if !code.is_success() || task.warning_count() > 0 {
            let path = state
                .export_task_issues_report(task.id(), out.as_deref(), options.open_report)
                .context("Failed to write the issues report")?;
            eprintln!("Issues report written to {}", path.display());
        }
    }

    state.shutdown();
    Ok(exit_code(code))
}

/// Drive progress output and prompts until the task ends.
async fn watch_task(
    task: &Task,
    events: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    interactive: bool,
) -> ResultCode {
    let show_progress = std::io::stderr().is_terminal();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let done = task.wait();
    tokio::pin!(done);

    loop {
        tokio::select! {
            code = &mut done => {
                if show_progress {
                    eprintln!();
                }
                return code;
            }
            _ = ticker.tick(), if show_progress => draw_progress(&task.snapshot()),
            event = events.recv() => match event {
                Ok(TaskEvent::PromptRaised { id, prompt }) if id == task.id() && interactive => {
                    if show_progress {
                        eprintln!();
                    }
                    ask(task, prompt).await;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return task.wait().await,
            },
        }
    }
}

fn draw_progress(snapshot: &ProgressSnapshot) {
    let total = snapshot
        .total_bytes()
        .map(|bytes| format!(" of {}", format_size(bytes)))
        .unwrap_or_default();
    let current = snapshot
        .current_item
        .as_ref()
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    eprint!(
        "\r\x1b[2K{:>5.1}% {:<12} {}{} at {}/s  {}",
        snapshot.percentage(),
        snapshot.phase.to_string(),
        format_size(snapshot.transferred_bytes),
        total,
        format_size(snapshot.bytes_per_second),
        truncate(&current, 40)
    );
    let _ = std::io::stderr().flush();
}

fn action_key(action: ConflictAction) -> char {
    match action {
        ConflictAction::Overwrite => 'o',
        ConflictAction::KeepBoth => 'k',
        ConflictAction::ReplaceReadOnly => 'r',
        ConflictAction::Skip => 's',
        ConflictAction::SkipAll => 'a',
        ConflictAction::Retry => 't',
        ConflictAction::Cancel => 'c',
    }
}

/// Ask on stdin until the user picks an offered action.
async fn ask(task: &Task, prompt: ConflictPrompt) {
    eprintln!("{}", prompt.message);
    eprintln!("  source:      {}", prompt.source.display());
    if let Some(destination) = &prompt.destination {
        eprintln!("  destination: {}", destination.display());
    }
    let choices = prompt
        .actions
        .iter()
        .map(|action| format!("[{}] {action}", action_key(*action)))
        .collect::<Vec<_>>()
        .join("  ");

    loop {
        eprint!("{choices}  (add ! to apply to all) > ");
        let _ = std::io::stderr().flush();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        let line = match line {
            Ok(Ok(line)) if !line.is_empty() => line,
            // No terminal input left: treat as cancel.
            _ => {
                let _ = task.submit_conflict_decision(ConflictAction::Cancel, false);
                return;
            }
        };

        let answer = line.trim();
        let apply_to_all = answer.ends_with('!');
        let key = answer.trim_end_matches('!');
        let chosen = prompt
            .actions
            .iter()
            .copied()
            .find(|action| key.len() == 1 && key.starts_with(action_key(*action)));

        match chosen.map(|action| task.submit_conflict_decision(action, apply_to_all)) {
            Some(Ok(())) => return,
            Some(Err(err)) => {
                // The prompt was already answered, e.g. by a cancel.
                warn!(error = %err, "decision not accepted");
                return;
            }
            None => eprintln!("Please choose one of the offered actions."),
        }
    }
}

fn print_outcome(task: &Task, code: ResultCode) {
    let snapshot = task.snapshot();
    println!(
        "{} {}: {} ({} items, {} skipped, {} failed, {})",
        task.kind(),
        task.id(),
        code,
        snapshot.completed_items,
        snapshot.skipped_items,
        snapshot.failed_items,
        format_size(snapshot.completed_bytes)
    );
    for issue in task.issues() {
        let path = issue
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  [{}] {}: {}", issue.severity, path, issue.message);
    }
}

fn exit_code(code: ResultCode) -> ExitCode {
    match code {
        ResultCode::Success => ExitCode::SUCCESS,
        ResultCode::PartialCopy => ExitCode::from(2),
        ResultCode::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

fn run_size(paths: &[PathBuf], json: bool) -> Result<ExitCode> {
    let local = LocalFileSystem::new();
    let reader = local
        .reader()
        .ok_or_else(|| eyre!("Local file system cannot list directories"))?;

    let mut rows: Vec<(PathBuf, SizeTotals)> = Vec::new();
    for path in paths {
        let path = absolute_one(path)?;
        let totals = reader
            .get_directory_size(&path, &WalkControl::none())
            .with_context(|| format!("Failed to size {}", path.display()))?;
        rows.push((path, totals));
    }

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(path, totals)| serde_json::json!({ "path": path, "totals": totals }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (path, totals) in &rows {
            println!(
                "{:>10}  {:>8} files  {:>6} folders  {}",
                format_size(totals.total_bytes),
                totals.file_count,
                totals.directory_count,
                path.display()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_self_test(config: EngineConfig) -> Result<ExitCode> {
    let runtime = build_runtime(&config).context("Failed to start the runtime")?;
    let suite = builtin_suite();
    eprintln!("Running {} self-test steps...", suite.len());

    let env = SelfTestEnv::new(config, runtime.handle().clone());
    let report = runtime.block_on(suite.run(&env));
    print!("{}", report.render());

    if report.all_passed() {
        println!("All {} steps passed.", report.outcomes.len());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{} of {} steps failed.", report.failed(), report.outcomes.len());
        Ok(ExitCode::FAILURE)
    }
}

fn run_config(config: &EngineConfig, init: bool, force: bool) -> Result<ExitCode> {
    if !init {
        print!("{}", config.to_toml());
        return Ok(ExitCode::SUCCESS);
    }

    let Some(path) = EngineConfig::default_path() else {
        bail!("No config directory on this platform");
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, EngineConfig::default().to_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 1).collect();
        format!("{head}…")
    }
}

/// Parse a size string (e.g. "512K", "4M", "1G", "2048").
fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let unit = &s[digits.len()..];
    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit '{other}'")),
    };
    let number: f64 = digits
        .parse()
        .map_err(|_| format!("'{s}' is not a size"))?;
    Ok((number * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2048").unwrap(), 2048);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1.5m").unwrap(), 1024 * 1024 * 3 / 2);
        assert!(parse_size("12parsecs").is_err());
    }

    #[test]
    fn test_flags_from_options() {
        let cli = Cli::parse_from([
            "twinpane",
            "copy",
            "a",
            "--to",
            "b",
            "--overwrite",
            "--no-recursive",
        ]);
        let Command::Copy { options, .. } = cli.command else {
            panic!("expected copy");
        };
        let flags = options.flags();
        assert!(flags.contains(OperationFlags::ALLOW_OVERWRITE));
        assert!(!flags.contains(OperationFlags::RECURSIVE));
        assert!(options.report.is_none());
    }
}

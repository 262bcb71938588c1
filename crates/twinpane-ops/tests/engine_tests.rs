use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use twinpane_core::{
    EngineConfig, ExecutionMode, LinkKind, OperationFlags, Pane, ReparsePolicy, ResultCode,
};
use twinpane_ops::selftest::{SelfTestEnv, builtin_suite};
use twinpane_ops::{
    ConflictAction, ConflictBucket, DiagnosticsError, EngineContext, FileOperationState,
    InformationalId, InformationalTask, MIN_SPEED_LIMIT, OperationRequest, RequestError, Task,
    TaskEvent, TaskPhase,
};
use twinpane_vfs::{FileSystem, InMemoryFileSystem, LocalFileSystem};

const WAIT: Duration = Duration::from_secs(10);

fn engine(tweak: impl FnOnce(&mut EngineConfig)) -> FileOperationState {
    let mut config = EngineConfig::default();
    tweak(&mut config);
    FileOperationState::new(EngineContext::current(config).unwrap())
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn answer(task: &Task, action: ConflictAction, apply_to_all: bool) {
    eventually("a conflict prompt", || task.active_prompt().is_some()).await;
    task.submit_conflict_decision(action, apply_to_all).unwrap();
}

fn shared(fs: &InMemoryFileSystem) -> Arc<dyn FileSystem> {
    Arc::new(fs.clone())
}

fn paths(items: &[&str]) -> Vec<PathBuf> {
    items.iter().map(PathBuf::from).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_copy_tree_between_memory_backends() {
    let state = engine(|_| {});
    let source = InMemoryFileSystem::new("left");
    source.add_file("/src/docs/a.txt", b"alpha".to_vec()).unwrap();
    source.add_file("/src/docs/nested/b.txt", b"bravo!".to_vec()).unwrap();
    source.add_dir("/src/docs/empty").unwrap();
    let destination = InMemoryFileSystem::new("right");

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&source), paths(&["/src/docs"]), "/backup")
                .with_destination_file_system(shared(&destination)),
        )
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);

    assert_eq!(destination.read_file("/backup/docs/a.txt").unwrap(), b"alpha");
    assert_eq!(
        destination.read_file("/backup/docs/nested/b.txt").unwrap(),
        b"bravo!"
    );
    assert!(destination.exists("/backup/docs/empty"));
    assert!(source.exists("/src/docs/a.txt"));

    let snapshot = task.snapshot();
    assert_eq!(snapshot.phase, TaskPhase::Completed);
    assert_eq!(snapshot.completed_items, 1);
    assert_eq!(snapshot.completed_folders, 1);
    assert_eq!(snapshot.completed_bytes, 11);
    assert!(snapshot.pre_calc.completed);
    assert_eq!(snapshot.pre_calc.totals.file_count, 2);
    assert_eq!(snapshot.percentage(), 100.0);
    assert!(state.find_summary(task.id()).is_some());
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_requests_create_no_task() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("mem");
    fs.add_dir("/src/tree").unwrap();

    let err = state
        .start_operation(OperationRequest::delete(shared(&fs), Vec::new()))
        .unwrap_err();
    assert_eq!(err, RequestError::NoSources);
    assert_eq!(err.code(), ResultCode::InvalidArgument);

    let err = state
        .start_operation(OperationRequest::copy(
            shared(&fs),
            paths(&["/src/tree"]),
            "/src/tree/inner",
        ))
        .unwrap_err();
    assert!(matches!(err, RequestError::InvalidDestination { .. }));

    let mut live = Vec::new();
    state.collect_tasks(&mut live);
    assert!(live.is_empty());
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_slot_released_by_cancelled_waiter() {
    let state = engine(|_| {});
    state.apply_queue_mode(true);
    assert!(state.queue_mode());

    let fs = InMemoryFileSystem::new("queue");
    fs.add_synthetic_file("/src/big.bin", 8 * 1024 * 1024).unwrap();
    fs.add_file("/src/b.txt", b"b".to_vec()).unwrap();
    fs.add_file("/src/c.txt", b"c".to_vec()).unwrap();

    let first = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/big.bin"]), "/one")
                .with_speed_limit(MIN_SPEED_LIMIT),
        )
        .unwrap();
    eventually("first task running", || first.has_started()).await;

    let second = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/b.txt"]), "/two"))
        .unwrap();
    let third = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/c.txt"]), "/three"))
        .unwrap();
    eventually("later tasks queued", || {
        second.phase() == TaskPhase::QueuePaused && third.phase() == TaskPhase::QueuePaused
    })
    .await;

    second.request_cancel();
    assert_eq!(second.wait().await, ResultCode::Cancelled);
    assert!(!fs.exists("/two/b.txt"));
    assert!(third.is_queue_paused());

    first.request_cancel();
    assert_eq!(first.wait().await, ResultCode::Cancelled);
    assert_eq!(third.wait().await, ResultCode::Success);
    assert_eq!(fs.read_file("/three/c.txt").unwrap(), b"c");
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_task_waits_before_sizing() {
    let state = engine(|_| {});
    state.apply_queue_mode(true);
    let fs = InMemoryFileSystem::new("sizing-queue").with_latency(Duration::from_millis(5));
    for i in 0..200 {
        fs.add_file(format!("/first/d{i}/f.txt"), b"x".to_vec()).unwrap();
    }
    for i in 0..3 {
        fs.add_file(format!("/second/d{i}/f.txt"), b"y".to_vec()).unwrap();
    }

    let first = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/first"]), "/one"))
        .unwrap();
    eventually("first task sizing", || {
        first.phase() == TaskPhase::PreCalculating && first.pre_calc().in_progress
    })
    .await;

    let second = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/second"]), "/two"))
        .unwrap();
    eventually("second task queue-paused", || {
        second.phase() == TaskPhase::QueuePaused
    })
    .await;
    assert!(first.pre_calc().in_progress);
    assert!(!second.pre_calc().completed);
    assert_eq!(second.pre_calc().totals.file_count, 0);

    first.request_cancel();
    assert_eq!(first.wait().await, ResultCode::Cancelled);
    assert_eq!(second.wait().await, ResultCode::Success);
    assert!(second.pre_calc().completed);
    assert_eq!(second.pre_calc().totals.file_count, 3);
    assert_eq!(fs.list_names("/two/second").len(), 3);
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_switching_to_parallel_releases_queued_tasks() {
    let state = engine(|_| {});
    state.apply_queue_mode(true);
    let fs = InMemoryFileSystem::new("parallel");
    fs.add_synthetic_file("/src/big.bin", 8 * 1024 * 1024).unwrap();
    fs.add_file("/src/b.txt", b"b".to_vec()).unwrap();
    for i in 0..3 {
        fs.add_file(format!("/later/tree/f{i}.txt"), b"t".to_vec()).unwrap();
    }

    let first = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/big.bin"]), "/one")
                .with_speed_limit(MIN_SPEED_LIMIT),
        )
        .unwrap();
    eventually("first task running", || first.has_started()).await;
    assert!(first.toggle_pause());

    let second = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/b.txt"]), "/two"))
        .unwrap();
    let third = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/later/tree"]), "/three"))
        .unwrap();
    eventually("later tasks queued", || {
        second.phase() == TaskPhase::QueuePaused && third.phase() == TaskPhase::QueuePaused
    })
    .await;
    assert!(!third.pre_calc().completed);

    state.apply_queue_mode(false);
    assert!(!state.queue_mode());
    assert_eq!(second.wait().await, ResultCode::Success);
    assert_eq!(third.wait().await, ResultCode::Success);
    assert_eq!(fs.read_file("/two/b.txt").unwrap(), b"b");
    assert!(third.pre_calc().completed);
    assert_eq!(third.pre_calc().totals.file_count, 3);

    // The head task is still held by its own pause.
    assert_eq!(first.phase(), TaskPhase::Paused);
    assert!(first.result().is_none());
    first.request_cancel();
    assert_eq!(first.wait().await, ResultCode::Cancelled);
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_pre_calculation_starts_transfer() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("sizing").with_latency(Duration::from_millis(5));
    for i in 0..200 {
        fs.add_file(format!("/src/tree/d{i}/f.txt"), b"x".to_vec()).unwrap();
    }

    let task = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/tree"]), "/dst"))
        .unwrap();
    eventually("sizing in progress", || task.pre_calc().in_progress).await;
    assert_eq!(task.phase(), TaskPhase::PreCalculating);
    task.skip_pre_calculation();
    eventually("transfer started", || task.has_started()).await;

    let totals = task.pre_calc();
    assert!(totals.skipped);
    assert!(!totals.completed);
    assert_eq!(task.snapshot().total_bytes(), None);

    assert_eq!(task.wait().await, ResultCode::Success);
    assert_eq!(fs.list_names("/dst/tree").len(), 200);
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_item_limit_bounds_in_flight_items() {
    for mode in [ExecutionMode::BulkItems, ExecutionMode::PerItem] {
        let state = engine(|config| config.copy_move_max_concurrency = 1);
        let fs = InMemoryFileSystem::new("knob").with_latency(Duration::from_millis(2));
        let mut sources = Vec::new();
        for i in 0..8 {
            let path = format!("/src/f{i}.bin");
            fs.add_synthetic_file(&path, 64 * 1024).unwrap();
            sources.push(PathBuf::from(path));
        }

        let task = state
            .start_operation(
                OperationRequest::copy(shared(&fs), sources, "/dst").with_execution_mode(mode),
            )
            .unwrap();
        assert_eq!(task.wait().await, ResultCode::Success, "{mode}");
        assert_eq!(task.peak_in_flight_item_count(), 1, "{mode}");
        assert_eq!(task.in_flight_item_count(), 0);
        assert_eq!(fs.list_names("/dst").len(), 8);
        state.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_apply_to_all_prompts_once() {
    let state = engine(|config| config.copy_move_max_concurrency = 2);
    let fs = InMemoryFileSystem::new("overwrite");
    let mut sources = Vec::new();
    for i in 0..6 {
        fs.add_file(format!("/src/f{i}.txt"), b"new".to_vec()).unwrap();
        fs.add_file(format!("/dst/f{i}.txt"), b"old data".to_vec()).unwrap();
        sources.push(PathBuf::from(format!("/src/f{i}.txt")));
    }
    let mut events = state.subscribe();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), sources, "/dst").require_confirmation(true),
        )
        .unwrap();
    eventually("a conflict prompt", || task.active_prompt().is_some()).await;
    let prompt = task.active_prompt().unwrap();
    assert_eq!(prompt.bucket, ConflictBucket::Exists);
    assert!(prompt.offers(ConflictAction::Overwrite));
    assert_eq!(task.phase(), TaskPhase::Prompting);
    task.submit_conflict_decision(ConflictAction::Overwrite, true)
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);

    let mut raised = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TaskEvent::PromptRaised { .. }) {
            raised += 1;
        }
    }
    assert_eq!(raised, 1);
    for i in 0..6 {
        assert_eq!(fs.read_file(format!("/dst/f{i}.txt")).unwrap(), b"new");
    }
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_cached_action_prompts_once_more() {
    let state = engine(|config| config.copy_move_max_concurrency = 1);
    let fs = InMemoryFileSystem::new("capped");
    fs.add_file("/src/a", b"a".to_vec()).unwrap();
    fs.add_file("/src/b", b"b".to_vec()).unwrap();
    fs.add_file("/src/c", b"c".to_vec()).unwrap();
    fs.add_file("/dst/a", b"old".to_vec()).unwrap();
    // Overwrite cannot replace a directory with a file.
    fs.add_dir("/dst/b").unwrap();
    fs.add_dir("/dst/c").unwrap();
    let mut events = state.subscribe();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/a", "/src/b", "/src/c"]), "/dst")
                .require_confirmation(true),
        )
        .unwrap();
    answer(&task, ConflictAction::Overwrite, true).await;

    eventually("the capped prompt", || {
        task.active_prompt().is_some_and(|p| p.source == Path::new("/src/b"))
    })
    .await;
    let prompt = task.active_prompt().unwrap();
    assert!(!prompt.offers(ConflictAction::Overwrite));
    assert!(!prompt.offers(ConflictAction::Retry));
    assert!(prompt.offers(ConflictAction::Skip));
    task.submit_conflict_decision(ConflictAction::Skip, false)
        .unwrap();

    assert_eq!(task.wait().await, ResultCode::PartialCopy);
    let mut raised = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TaskEvent::PromptRaised { .. }) {
            raised += 1;
        }
    }
    assert_eq!(raised, 2);
    assert_eq!(fs.read_file("/dst/a").unwrap(), b"a");
    assert!(fs.file_size("/dst/c").is_none());
    assert_eq!(task.snapshot().skipped_items, 2);
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keep_both_writes_next_to_existing() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("keep");
    fs.add_file("/src/report.txt", b"fresh".to_vec()).unwrap();
    fs.add_file("/dst/report.txt", b"original".to_vec()).unwrap();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/report.txt"]), "/dst")
                .require_confirmation(true),
        )
        .unwrap();
    answer(&task, ConflictAction::KeepBoth, false).await;
    assert_eq!(task.wait().await, ResultCode::Success);

    assert_eq!(fs.read_file("/dst/report.txt").unwrap(), b"original");
    assert_eq!(fs.read_file("/dst/report (1).txt").unwrap(), b"fresh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_after_lock_released() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("locked");
    fs.add_file("/src/db.bin", b"v2".to_vec()).unwrap();
    fs.add_file("/dst/db.bin", b"v1".to_vec()).unwrap();
    fs.set_locked("/dst/db.bin", true).unwrap();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/db.bin"]), "/dst")
                .with_flags(OperationFlags::standard() | OperationFlags::ALLOW_OVERWRITE)
                .require_confirmation(true),
        )
        .unwrap();
    eventually("a conflict prompt", || task.active_prompt().is_some()).await;
    let prompt = task.active_prompt().unwrap();
    assert_eq!(prompt.bucket, ConflictBucket::SharingViolation);
    assert!(prompt.offers(ConflictAction::Retry));

    fs.set_locked("/dst/db.bin", false).unwrap();
    task.submit_conflict_decision(ConflictAction::Retry, false)
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);
    assert_eq!(fs.read_file("/dst/db.bin").unwrap(), b"v2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_interactive_conflict_aborts_with_its_code() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("strict");
    fs.add_file("/src/a.txt", b"a".to_vec()).unwrap();
    fs.add_file("/dst/a.txt", b"old".to_vec()).unwrap();

    let task = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/a.txt"]), "/dst"))
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::AlreadyExists);
    assert!(task.error_count() >= 1);
    assert_eq!(fs.read_file("/dst/a.txt").unwrap(), b"old");

    let summary = state.find_summary(task.id()).unwrap();
    assert_eq!(summary.result, ResultCode::AlreadyExists);
    assert!(!summary.issues.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_respects_read_only_items() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("ro");
    fs.add_file("/data/locked.txt", b"keep".to_vec()).unwrap();
    fs.add_file("/data/plain.txt", b"gone".to_vec()).unwrap();
    fs.set_read_only("/data/locked.txt", true).unwrap();

    let task = state
        .start_operation(OperationRequest::delete(shared(&fs), paths(&["/data/locked.txt"])))
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::AccessDenied);
    assert!(fs.exists("/data/locked.txt"));

    let task = state
        .start_operation(
            OperationRequest::delete(
                shared(&fs),
                paths(&["/data/locked.txt", "/data/plain.txt"]),
            )
            .with_flags(OperationFlags::standard() | OperationFlags::CONTINUE_ON_ERROR),
        )
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::PartialCopy);
    assert!(fs.exists("/data/locked.txt"));
    assert!(!fs.exists("/data/plain.txt"));
    assert!(task.warning_count() >= 1);

    let task = state
        .start_operation(
            OperationRequest::delete(shared(&fs), paths(&["/data"]))
                .with_flags(OperationFlags::standard() | OperationFlags::ALLOW_REPLACE_READONLY),
        )
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);
    assert!(!fs.exists("/data"));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_keeps_parents_of_skipped_entries() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("tree");
    fs.add_file("/tree/a/keep.txt", b"k".to_vec()).unwrap();
    fs.add_file("/tree/a/drop.txt", b"d".to_vec()).unwrap();
    fs.add_file("/tree/b/drop.txt", b"d".to_vec()).unwrap();
    fs.set_read_only("/tree/a/keep.txt", true).unwrap();

    let task = state
        .start_operation(
            OperationRequest::delete(shared(&fs), paths(&["/tree"])).require_confirmation(true),
        )
        .unwrap();
    eventually("a conflict prompt", || task.active_prompt().is_some()).await;
    assert_eq!(task.active_prompt().unwrap().bucket, ConflictBucket::ReadOnly);
    task.submit_conflict_decision(ConflictAction::Skip, false)
        .unwrap();

    assert_eq!(task.wait().await, ResultCode::PartialCopy);
    assert!(fs.exists("/tree/a/keep.txt"));
    assert!(!fs.exists("/tree/a/drop.txt"));
    assert!(!fs.exists("/tree/b"));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recycle_bin_delete() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("bin");
    fs.add_file("/docs/old/a.txt", b"a".to_vec()).unwrap();
    fs.add_file("/docs/b.txt", b"b".to_vec()).unwrap();

    let task = state
        .start_operation(
            OperationRequest::delete(shared(&fs), paths(&["/docs/old", "/docs/b.txt"]))
                .with_flags(OperationFlags::standard() | OperationFlags::USE_RECYCLE_BIN),
        )
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);
    assert!(!fs.exists("/docs/old"));
    assert!(!fs.exists("/docs/b.txt"));

    let mut binned = fs.recycle_bin();
    binned.sort();
    assert_eq!(binned, paths(&["/docs/b.txt", "/docs/old"]));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_renames_within_a_backend() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("same");
    fs.add_file("/src/notes.txt", b"notes".to_vec()).unwrap();
    fs.add_file("/src/album/one.jpg", vec![1; 64]).unwrap();

    let task = state
        .start_operation(OperationRequest::move_to(
            shared(&fs),
            paths(&["/src/notes.txt", "/src/album"]),
            "/archive",
        ))
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);

    assert_eq!(fs.read_file("/archive/notes.txt").unwrap(), b"notes");
    assert_eq!(fs.file_size("/archive/album/one.jpg"), Some(64));
    assert!(!fs.exists("/src/notes.txt"));
    assert!(!fs.exists("/src/album"));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_across_backends_copies_then_deletes() {
    let state = engine(|_| {});
    let source = InMemoryFileSystem::new("left");
    source.add_file("/src/album/one.jpg", vec![1; 10]).unwrap();
    source.add_file("/src/album/two/three.jpg", vec![3; 30]).unwrap();
    let destination = InMemoryFileSystem::new("right");
    destination.add_file("/dst/album/existing.jpg", vec![9; 5]).unwrap();

    let task = state
        .start_operation(
            OperationRequest::move_to(shared(&source), paths(&["/src/album"]), "/dst")
                .with_destination_file_system(shared(&destination)),
        )
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);

    assert_eq!(destination.file_size("/dst/album/one.jpg"), Some(10));
    assert_eq!(destination.file_size("/dst/album/two/three.jpg"), Some(30));
    assert_eq!(destination.file_size("/dst/album/existing.jpg"), Some(5));
    assert!(!source.exists("/src/album"));
    assert!(source.exists("/src"));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_links_inside_copied_tree_are_rewritten() {
    let state = engine(|config| config.reparse_policy = ReparsePolicy::CopyReparse);
    let fs = InMemoryFileSystem::new("links");
    fs.add_file("/src/proj/data/file.txt", b"d".to_vec()).unwrap();
    fs.add_link("/src/proj/current", LinkKind::DirectorySymlink, "/src/proj/data")
        .unwrap();

    let task = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/proj"]), "/dst"))
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);

    let link = fs
        .reader()
        .unwrap()
        .get_attributes(Path::new("/dst/proj/current"))
        .unwrap();
    assert_eq!(
        link.kind.link().map(|info| info.target.clone()),
        Some(PathBuf::from("/dst/proj/data"))
    );
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsupported_link_offers_only_skip_or_cancel() {
    let state = engine(|config| config.reparse_policy = ReparsePolicy::Skip);
    let source = InMemoryFileSystem::new("links");
    source
        .add_link("/src/junction", LinkKind::Junction, "/elsewhere")
        .unwrap();
    let destination = InMemoryFileSystem::new("plain").with_link_support(false);

    let task = state
        .start_operation(
            OperationRequest::move_to(shared(&source), paths(&["/src/junction"]), "/dst")
                .with_destination_file_system(shared(&destination))
                .require_confirmation(true),
        )
        .unwrap();
    eventually("a conflict prompt", || task.active_prompt().is_some()).await;
    let prompt = task.active_prompt().unwrap();
    assert_eq!(prompt.bucket, ConflictBucket::UnsupportedReparse);
    assert_eq!(
        prompt.actions,
        vec![
            ConflictAction::Skip,
            ConflictAction::SkipAll,
            ConflictAction::Cancel
        ]
    );
    assert!(task.submit_conflict_decision(ConflictAction::Overwrite, false).is_err());
    task.submit_conflict_decision(ConflictAction::Skip, false)
        .unwrap();

    assert_eq!(task.wait().await, ResultCode::PartialCopy);
    assert!(source.exists("/src/junction"));
    assert!(!destination.exists("/dst/junction"));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_does_not_rename_nested_links_away() {
    let state = engine(|config| config.reparse_policy = ReparsePolicy::Skip);
    let fs = InMemoryFileSystem::new("nested");
    fs.add_file("/src/proj/data.txt", b"d".to_vec()).unwrap();
    fs.add_link("/src/proj/current", LinkKind::FileSymlink, "/src/proj/data.txt")
        .unwrap();

    let task = state
        .start_operation(
            OperationRequest::move_to(shared(&fs), paths(&["/src/proj"]), "/dst")
                .require_confirmation(true),
        )
        .unwrap();
    eventually("a conflict prompt", || task.active_prompt().is_some()).await;
    let prompt = task.active_prompt().unwrap();
    assert_eq!(prompt.bucket, ConflictBucket::UnsupportedReparse);
    assert_eq!(prompt.source, Path::new("/src/proj/current"));
    task.submit_conflict_decision(ConflictAction::Skip, false)
        .unwrap();

    assert_eq!(task.wait().await, ResultCode::PartialCopy);
    assert_eq!(fs.read_file("/dst/proj/data.txt").unwrap(), b"d");
    assert!(!fs.exists("/src/proj/data.txt"));
    assert!(fs.exists("/src/proj/current"));
    assert!(!fs.exists("/dst/proj/current"));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_from_prompt_ends_task() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("cancel");
    fs.add_file("/src/a.txt", b"a".to_vec()).unwrap();
    fs.add_file("/dst/a.txt", b"b".to_vec()).unwrap();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/a.txt"]), "/dst")
                .require_confirmation(true),
        )
        .unwrap();
    answer(&task, ConflictAction::Cancel, false).await;
    assert_eq!(task.wait().await, ResultCode::Cancelled);
    assert!(task.active_prompt().is_none());
    assert_eq!(fs.read_file("/dst/a.txt").unwrap(), b"b");
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_speed_limit_is_clamped() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("limit");
    fs.add_synthetic_file("/src/big.bin", 4 * 1024 * 1024).unwrap();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/big.bin"]), "/dst")
                .with_speed_limit(1),
        )
        .unwrap();
    assert_eq!(task.desired_speed_limit(), 1);
    assert_eq!(task.effective_speed_limit(), MIN_SPEED_LIMIT);

    task.set_desired_speed_limit(0);
    assert_eq!(task.effective_speed_limit(), 0);
    assert_eq!(task.wait().await, ResultCode::Success);
    assert_eq!(fs.file_size("/dst/big.bin"), Some(4 * 1024 * 1024));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_issues_report_export() {
    let reports = TempDir::new().unwrap();
    let dir = reports.path().to_path_buf();
    let state = engine(move |config| config.report_dir = dir);
    let fs = InMemoryFileSystem::new("report");
    fs.add_file("/src/a.txt", b"a".to_vec()).unwrap();
    fs.add_file("/src/b.txt", b"b".to_vec()).unwrap();
    fs.add_file("/dst/b.txt", b"old".to_vec()).unwrap();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/a.txt", "/src/b.txt"]), "/dst")
                .with_flags(OperationFlags::standard() | OperationFlags::CONTINUE_ON_ERROR)
                .with_panes(Pane::Right, Pane::Left),
        )
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::PartialCopy);
    assert!(state.find_task(task.id()).is_none());
    let summary = state.find_summary(task.id()).unwrap();
    assert_eq!(summary.source_pane, Pane::Right);

    let path = state
        .export_task_issues_report(task.id(), None, false)
        .unwrap();
    assert!(path.starts_with(reports.path()));
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains(&task.id().to_string()));
    assert!(text.contains("/src/b.txt"));

    let custom = reports.path().join("nested").join("custom.txt");
    let written = state
        .export_task_issues_report(task.id(), Some(&custom), false)
        .unwrap();
    assert_eq!(written, custom);
    assert!(custom.exists());

    let unknown = twinpane_core::TaskId(9_999);
    assert!(matches!(
        state.export_task_issues_report(unknown, None, false),
        Err(DiagnosticsError::UnknownTask { .. })
    ));
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_export_refuses_running_task() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("running");
    fs.add_synthetic_file("/src/big.bin", 4 * 1024 * 1024).unwrap();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/big.bin"]), "/dst")
                .with_speed_limit(MIN_SPEED_LIMIT),
        )
        .unwrap();
    eventually("transfer started", || task.has_started()).await;
    assert_eq!(state.find_task(task.id()).map(|t| t.id()), Some(task.id()));
    assert!(matches!(
        state.export_task_issues_report(task.id(), None, false),
        Err(DiagnosticsError::TaskStillRunning { .. })
    ));
    task.request_cancel();
    assert_eq!(task.wait().await, ResultCode::Cancelled);
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auto_dismiss_keeps_failures_only() {
    let state = engine(|config| config.max_retained_summaries = 2);
    let fs = InMemoryFileSystem::new("dismiss");
    fs.add_file("/src/a.txt", b"a".to_vec()).unwrap();
    fs.add_file("/dst/a.txt", b"x".to_vec()).unwrap();

    let ok = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/a.txt"]), "/other"))
        .unwrap();
    assert_eq!(ok.wait().await, ResultCode::Success);
    assert!(state.find_summary(ok.id()).is_some());

    state.set_auto_dismiss_success(true);
    assert!(state.auto_dismiss_success());
    assert!(state.find_summary(ok.id()).is_none());

    let again = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/a.txt"]), "/third"))
        .unwrap();
    assert_eq!(again.wait().await, ResultCode::Success);
    assert!(state.find_summary(again.id()).is_none());

    let failed = state
        .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/a.txt"]), "/dst"))
        .unwrap();
    assert_eq!(failed.wait().await, ResultCode::AlreadyExists);
    let mut completed = Vec::new();
    state.collect_completed_tasks(&mut completed);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, failed.id());
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_informational_cards() {
    let state = engine(|_| {});
    let id = InformationalId(1);
    state.create_or_update_informational_task(InformationalTask::new(id, "Comparing folders"));
    state.create_or_update_informational_task(
        InformationalTask::new(id, "Comparing folders").with_progress(3, Some(4)),
    );
    state.create_or_update_informational_task(InformationalTask::new(
        InformationalId(2),
        "Renaming",
    ));

    let cards = state.informational_tasks();
    assert_eq!(cards.len(), 2);
    assert_eq!(cards[0].percentage(), Some(75.0));

    assert!(state.dismiss_informational_task(id));
    assert!(!state.dismiss_informational_task(id));
    assert_eq!(state.informational_tasks().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_cancels_and_closes_events() {
    let state = engine(|_| {});
    let fs = InMemoryFileSystem::new("shutdown");
    fs.add_synthetic_file("/src/big.bin", 8 * 1024 * 1024).unwrap();
    let mut events = state.subscribe();

    let task = state
        .start_operation(
            OperationRequest::copy(shared(&fs), paths(&["/src/big.bin"]), "/dst")
                .with_speed_limit(MIN_SPEED_LIMIT),
        )
        .unwrap();
    eventually("transfer started", || task.has_started()).await;

    state.shutdown();
    assert!(state.is_shut_down());
    assert_eq!(task.wait().await, ResultCode::Cancelled);
    assert_eq!(
        state
            .start_operation(OperationRequest::copy(shared(&fs), paths(&["/src/big.bin"]), "/x"))
            .unwrap_err(),
        RequestError::ShuttingDown
    );

    let mut started = false;
    loop {
        match events.recv().await {
            Ok(TaskEvent::Started { id, .. }) => started |= id == task.id(),
            Ok(TaskEvent::Completed { .. }) => panic!("event delivered after shutdown"),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    assert!(started);
    assert!(!fs.exists("/dst/big.bin"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_delete_of_large_directory() {
    let temp = TempDir::new().unwrap();
    let bulk = temp.path().join("bulk");
    fs::create_dir(&bulk).unwrap();
    for i in 0..3000 {
        fs::write(bulk.join(format!("entry-with-a-long-name-{i:05}.dat")), b"x").unwrap();
    }

    let state = engine(|_| {});
    let local = LocalFileSystem::new().with_enumeration_buffer(4096);
    let task = state
        .start_operation(OperationRequest::delete(Arc::new(local), vec![bulk.clone()]))
        .unwrap();
    assert_eq!(task.wait().await, ResultCode::Success);

    assert!(!bulk.exists());
    assert!(temp.path().exists());
    let snapshot = task.snapshot();
    assert_eq!(snapshot.completed_items, 1);
    assert_eq!(snapshot.pre_calc.totals.file_count, 3000);
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_throttled_copy_pause_resume_cancel() {
    const SIZE: usize = 32 * 1024 * 1024;
    const LIMIT: u64 = 1024 * 1024;

    let temp = TempDir::new().unwrap();
    let source = temp.path().join("payload.bin");
    fs::write(&source, vec![0x5a; SIZE]).unwrap();
    let destination = temp.path().join("out");

    let state = engine(|_| {});
    let task = state
        .start_operation(
            OperationRequest::copy(
                Arc::new(LocalFileSystem::new()),
                vec![source.clone()],
                destination.clone(),
            )
            .with_speed_limit(LIMIT),
        )
        .unwrap();
    eventually("bytes moving", || task.snapshot().transferred_bytes > 0).await;

    assert!(task.toggle_pause());
    assert!(task.is_paused());
    assert_eq!(task.phase(), TaskPhase::Paused);
    tokio::time::sleep(Duration::from_millis(600)).await;
    let held = task.snapshot().transferred_bytes;
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(task.snapshot().transferred_bytes, held);

    assert!(!task.toggle_pause());
    eventually("transfer resumed", || task.snapshot().transferred_bytes > held).await;
    let moved = task.snapshot().transferred_bytes;
    assert!(moved < SIZE as u64);

    task.request_cancel();
    assert_eq!(task.wait().await, ResultCode::Cancelled);
    assert_eq!(task.phase(), TaskPhase::Cancelled);

    let leftovers: Vec<String> = fs::read_dir(&destination)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        leftovers.iter().all(|name| !LocalFileSystem::is_temp_name(name)),
        "temp artifacts left: {leftovers:?}"
    );
    assert!(!destination.join("payload.bin").exists());
    assert!(source.exists());
    state.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_builtin_self_test_suite_passes() {
    let env = SelfTestEnv::new(EngineConfig::default(), tokio::runtime::Handle::current());
    let suite = builtin_suite();
    assert!(!suite.is_empty());

    let report = suite.run(&env).await;
    assert_eq!(report.outcomes.len(), suite.len());
    assert!(report.all_passed(), "{}", report.render());
}

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tempfile::TempDir;
use twinpane_vfs::{
    DirectoryReader, FileSystem, FsError, InMemoryFileSystem, LocalFileSystem, SizeTotals,
    WalkControl, synthetic_byte,
};

#[test]
fn test_single_file_root_sizes_without_walking() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("payload.bin");
    fs::write(&file, vec![7u8; 123_456]).unwrap();

    let local = LocalFileSystem::new();
    let totals = local
        .reader()
        .unwrap()
        .get_directory_size(&file, &WalkControl::none())
        .unwrap();
    assert_eq!(totals, SizeTotals::single_file(123_456));

    let remote = InMemoryFileSystem::new("remote");
    remote.add_synthetic_file("/payload.bin", 123_456).unwrap();
    let totals = remote
        .reader()
        .unwrap()
        .get_directory_size(Path::new("/payload.bin"), &WalkControl::none())
        .unwrap();
    assert_eq!(totals.total_bytes, 123_456);
    assert_eq!(totals.file_count, 1);
    assert_eq!(totals.directory_count, 0);
}

#[test]
fn test_listing_grows_past_small_enumeration_buffer() {
    let temp = TempDir::new().unwrap();
    for i in 0..3000 {
        fs::write(temp.path().join(format!("file-{i:05}.txt")), b"x").unwrap();
    }

    let local = LocalFileSystem::new().with_enumeration_buffer(4 * 1024);
    let entries = local.read_directory_info(temp.path()).unwrap();
    assert_eq!(entries.len(), 3000);
    assert!(entries.iter().all(|e| e.size == 1));

    let (entries, small) = local.read_directory_batched(temp.path()).unwrap();
    assert_eq!(entries.len(), 3000);
    assert!(small.batches > 1, "{small:?}");
    assert_eq!(small.final_buffer, 4 * 1024);

    let (_, default) = LocalFileSystem::new()
        .read_directory_batched(temp.path())
        .unwrap();
    assert!(default.batches < small.batches);
}

#[test]
fn test_oversized_entry_grows_then_trims_buffer() {
    let temp = TempDir::new().unwrap();
    let long = "n".repeat(200);
    fs::write(temp.path().join(&long), b"x").unwrap();
    fs::write(temp.path().join("short.txt"), b"y").unwrap();

    let local = LocalFileSystem::new().with_enumeration_buffer(0);
    let (entries, stats) = local.read_directory_batched(temp.path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(stats.peak_buffer > stats.final_buffer, "{stats:?}");
    assert!(entries.iter().any(|e| e.name.as_str() == long));
}

#[test]
fn test_sizing_stops_when_asked() {
    let remote = InMemoryFileSystem::new("remote");
    for i in 0..600 {
        remote
            .add_synthetic_file(format!("/tree/f{i}.bin"), 10)
            .unwrap();
    }

    let stop = AtomicBool::new(true);
    let should_stop = || stop.load(Ordering::Relaxed);
    let control = WalkControl::none().with_stop(&should_stop);
    let err = remote
        .get_directory_size(Path::new("/tree"), &control)
        .unwrap_err();
    assert!(matches!(err, FsError::Cancelled));
}

#[test]
fn test_sizing_reports_progress() {
    let remote = InMemoryFileSystem::new("remote");
    for i in 0..1000 {
        remote
            .add_synthetic_file(format!("/tree/d{}/f{i}.bin", i % 4), 1)
            .unwrap();
    }

    let reports = AtomicU64::new(0);
    let on_progress = |_: &SizeTotals| {
        reports.fetch_add(1, Ordering::Relaxed);
    };
    let control = WalkControl::none().with_progress(&on_progress);
    let totals = remote
        .get_directory_size(Path::new("/tree"), &control)
        .unwrap();

    assert_eq!(totals.file_count, 1000);
    assert_eq!(totals.directory_count, 4);
    assert!(reports.load(Ordering::Relaxed) >= 2);
}

#[test]
fn test_synthetic_content_is_readable() {
    let remote = InMemoryFileSystem::new("remote");
    remote.add_synthetic_file("/data.bin", 600).unwrap();
    let bytes = remote.read_file("/data.bin").unwrap();
    assert_eq!(bytes.len(), 600);
    assert_eq!(bytes[300], synthetic_byte(300));
}

#[test]
fn test_item_properties_describe_links() {
    let remote = InMemoryFileSystem::new("remote");
    remote
        .add_link("/a/link", twinpane_vfs::LinkKind::Junction, "/elsewhere")
        .unwrap();
    let props = remote
        .get_item_properties(Path::new("/a/link"))
        .unwrap();
    assert_eq!(props["kind"], "junction");
    assert_eq!(props["linkTarget"], "/elsewhere");
}

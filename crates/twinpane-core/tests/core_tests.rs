use std::io::Write;
use std::time::{Duration, SystemTime};

use twinpane_core::{
    ConfigError, EngineConfig, FileAttributes, FileBasicInfo, FsError, ItemInfo, ItemKind,
    LinkInfo, LinkKind, OperationFlags, OperationKind, ReparsePolicy, ResultCode, SizeTotals,
    TaskIdGenerator, Timestamps,
};

#[test]
fn test_timestamps() {
    let now = SystemTime::now();
    let timestamps = Timestamps::with_modified(now);

    assert_eq!(timestamps.modified, now);
    assert!(timestamps.accessed.is_none());
    assert!(timestamps.created.is_none());

    let accessed = now - Duration::from_secs(3600);
    let created = now - Duration::from_secs(7200);

    let full = Timestamps::new(now, Some(accessed), Some(created));
    assert_eq!(full.accessed, Some(accessed));
    assert_eq!(full.created, Some(created));
}

#[test]
fn test_item_info_kinds() {
    let link = ItemInfo::new(
        "/src/tree/shortcut",
        ItemKind::Link(LinkInfo {
            kind: LinkKind::Junction,
            target: "/elsewhere".into(),
        }),
        0,
        FileBasicInfo::default(),
    );
    assert_eq!(link.name, "shortcut");
    assert!(link.kind.link().is_some());
    assert!(!link.is_dir());

    let locked = ItemInfo::new(
        "/src/tree/locked.txt",
        ItemKind::File,
        10,
        FileBasicInfo {
            timestamps: Timestamps::default(),
            attributes: FileAttributes::READ_ONLY,
        },
    );
    assert!(locked.is_read_only());
}

#[test]
fn test_fs_error_codes() {
    let cases = [
        (
            FsError::AlreadyExists { path: "/a".into() },
            ResultCode::AlreadyExists,
        ),
        (FsError::ReadOnly { path: "/a".into() }, ResultCode::AccessDenied),
        (
            FsError::SharingViolation { path: "/a".into() },
            ResultCode::SharingViolation,
        ),
        (
            FsError::UnsupportedReparse { path: "/a".into() },
            ResultCode::NotSupported,
        ),
        (FsError::Cancelled, ResultCode::Cancelled),
        (FsError::backend("/a", "connection reset"), ResultCode::Failed),
    ];
    for (err, code) in cases {
        assert_eq!(err.code(), code, "{err}");
    }
    assert!(FsError::Cancelled.path().is_none());
}

#[test]
fn test_fs_error_io_not_found_keeps_path() {
    let err = FsError::io(
        "/missing",
        std::io::Error::from(std::io::ErrorKind::NotFound),
    );
    assert_eq!(err.code(), ResultCode::NotFound);
    assert_eq!(err.path().unwrap(), std::path::Path::new("/missing"));
}

#[test]
fn test_size_totals_single_file() {
    let totals = SizeTotals::single_file(4096);
    assert_eq!(totals.total_bytes, 4096);
    assert_eq!(totals.file_count, 1);
    assert_eq!(totals.directory_count, 0);
}

#[test]
fn test_task_id_generator() {
    let ids = TaskIdGenerator::new();
    let seen: Vec<_> = (0..100).map(|_| ids.next_id()).collect();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_config_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "copy_move_max_concurrency = 2").unwrap();
    writeln!(file, "wait_for_others = true").unwrap();
    writeln!(file, "reparse_policy = \"skip\"").unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.copy_move_max_concurrency, 2);
    assert!(config.wait_for_others);
    assert_eq!(config.reparse_policy, ReparsePolicy::Skip);
    assert_eq!(
        config.concurrency_for(OperationKind::Move, OperationFlags::RECURSIVE),
        2
    );
}

#[test]
fn test_config_load_errors() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "copy_move_max_concurrency = \"lots\"").unwrap();
    let err = EngineConfig::load(&bad).unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, bad),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_config_toml_round_trip_keeps_knobs() {
    let config = EngineConfig::builder()
        .delete_max_concurrency(3usize)
        .build()
        .unwrap();
    let parsed = EngineConfig::from_toml(&config.to_toml()).unwrap();
    assert_eq!(parsed, config);
}

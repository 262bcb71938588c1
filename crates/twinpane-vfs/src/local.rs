//! Local disk backend.

use std::fs::{self, File, Metadata};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use filetime::FileTime;
use jwalk::WalkDir;
use tracing::{debug, warn};

use twinpane_core::{
    FileAttributes, FileBasicInfo, FsError, FsResult, ItemInfo, ItemKind, LinkInfo, LinkKind,
    OperationFlags, SizeTotals, Timestamps,
};

use crate::fs::{
    DirectoryOperations, DirectoryReader, FileIo, FileReader, FileSystem, FileWriter,
    ReparseLink, WriteOptions,
};
use crate::size::{PROGRESS_INTERVAL, WalkControl};

/// Default listing buffer, in bytes.
pub const DEFAULT_ENUMERATION_BUFFER: usize = 64 * 1024;

/// Rough per-entry cost used to size the listing buffer.
const ENTRY_BYTES_ESTIMATE: usize = 96;

const TEMP_SUFFIX: &str = "twinpane-partial";

/// The machine's own file system.
#[derive(Debug)]
pub struct LocalFileSystem {
    enumeration_buffer: usize,
    temp_counter: AtomicU64,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self {
            enumeration_buffer: DEFAULT_ENUMERATION_BUFFER,
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Byte budget for one batch of raw directory entries. Larger listings
    /// are read in several batches; a single oversized entry grows the
    /// buffer, which is trimmed again once the listing is complete.
    pub fn with_enumeration_buffer(mut self, bytes: usize) -> Self {
        self.enumeration_buffer = bytes.max(ENTRY_BYTES_ESTIMATE);
        self
    }

    /// Whether `name` is an in-progress writer's temp file.
    pub fn is_temp_name(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
    }

    fn temp_path_for(&self, target: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}.{}-{n}.{TEMP_SUFFIX}", std::process::id()))
    }
}

/// How a listing used the enumeration buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingStats {
    /// Batches the raw entries were collected in.
    pub batches: u64,
    /// Largest buffer size reached, in bytes.
    pub peak_buffer: usize,
    /// Buffer size once the listing finished.
    pub final_buffer: usize,
}

impl LocalFileSystem {
    /// List `path` in batches of at most one enumeration buffer of raw
    /// entries. An entry larger than the buffer grows it; the buffer is
    /// trimmed back to the configured size afterwards.
    pub fn read_directory_batched(&self, path: &Path) -> FsResult<(Vec<ItemInfo>, ListingStats)> {
        let mut budget = self.enumeration_buffer;
        let mut stats = ListingStats {
            peak_buffer: budget,
            ..ListingStats::default()
        };
        let mut batch: Vec<fs::DirEntry> = Vec::with_capacity(budget / ENTRY_BYTES_ESTIMATE);
        let mut used = 0usize;
        let mut entries = Vec::new();

        let listing = fs::read_dir(path).map_err(|e| FsError::io(path, e))?;
        for entry in listing {
            let entry = entry.map_err(|e| FsError::io(path, e))?;
            let cost = ENTRY_BYTES_ESTIMATE + entry.file_name().len();

            if used + cost > budget && !batch.is_empty() {
                describe_batch(&mut batch, &mut entries)?;
                stats.batches += 1;
                used = 0;
            }
            if cost > budget {
                budget = budget.saturating_mul(2).max(cost);
                stats.peak_buffer = stats.peak_buffer.max(budget);
                debug!(path = %path.display(), budget, "Growing enumeration buffer");
            }
            used += cost;
            batch.push(entry);
        }
        if !batch.is_empty() {
            describe_batch(&mut batch, &mut entries)?;
            stats.batches += 1;
        }

        if budget > self.enumeration_buffer {
            debug!(path = %path.display(), from = budget, to = self.enumeration_buffer, "Trimming enumeration buffer");
        }
        stats.final_buffer = self.enumeration_buffer;
        entries.shrink_to_fit();
        Ok((entries, stats))
    }
}

/// Stat and describe a batch of raw entries, leaving the batch empty.
fn describe_batch(batch: &mut Vec<fs::DirEntry>, out: &mut Vec<ItemInfo>) -> FsResult<()> {
    for entry in batch.drain(..) {
        let entry_path = entry.path();
        let metadata = match fs::symlink_metadata(&entry_path) {
            Ok(m) => m,
            // Removed between listing and stat.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(FsError::io(&entry_path, err)),
        };
        out.push(describe(&entry_path, &metadata)?);
    }
    Ok(())
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for LocalFileSystem {
    fn name(&self) -> &str {
        "Local disk"
    }

    fn id(&self) -> &str {
        "local"
    }

    fn reader(&self) -> Option<&dyn DirectoryReader> {
        Some(self)
    }

    fn io(&self) -> Option<&dyn FileIo> {
        Some(self)
    }

    fn operations(&self) -> Option<&dyn DirectoryOperations> {
        Some(self)
    }

    fn links(&self) -> Option<&dyn ReparseLink> {
        Some(self)
    }
}

fn timestamps_of(metadata: &Metadata) -> Timestamps {
    Timestamps::new(
        metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
        metadata.accessed().ok(),
        metadata.created().ok(),
    )
}

fn attributes_of(path: &Path, metadata: &Metadata) -> FileAttributes {
    let mut attributes = FileAttributes::empty();
    if metadata.permissions().readonly() {
        attributes |= FileAttributes::READ_ONLY;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
        const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
        const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x20;
        let raw = metadata.file_attributes();
        attributes.set(FileAttributes::HIDDEN, raw & FILE_ATTRIBUTE_HIDDEN != 0);
        attributes.set(FileAttributes::SYSTEM, raw & FILE_ATTRIBUTE_SYSTEM != 0);
        attributes.set(FileAttributes::ARCHIVE, raw & FILE_ATTRIBUTE_ARCHIVE != 0);
    }

    #[cfg(not(windows))]
    if path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
    {
        attributes |= FileAttributes::HIDDEN;
    }

    let _ = path;
    attributes
}

#[cfg(windows)]
fn link_kind(_path: &Path, metadata: &Metadata) -> LinkKind {
    use std::os::windows::fs::FileTypeExt;
    if metadata.file_type().is_symlink_dir() {
        LinkKind::DirectorySymlink
    } else {
        LinkKind::FileSymlink
    }
}

#[cfg(not(windows))]
fn link_kind(path: &Path, _metadata: &Metadata) -> LinkKind {
    match fs::metadata(path) {
        Ok(target) if target.is_dir() => LinkKind::DirectorySymlink,
        _ => LinkKind::FileSymlink,
    }
}

fn describe(path: &Path, metadata: &Metadata) -> FsResult<ItemInfo> {
    let basic = FileBasicInfo {
        timestamps: timestamps_of(metadata),
        attributes: attributes_of(path, metadata),
    };
    let file_type = metadata.file_type();
    let (kind, size) = if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| FsError::io(path, e))?;
        let kind = link_kind(path, metadata);
        (ItemKind::Link(LinkInfo { kind, target }), 0)
    } else if file_type.is_dir() {
        (ItemKind::Directory, 0)
    } else {
        (ItemKind::File, metadata.len())
    };
    Ok(ItemInfo::new(path, kind, size, basic))
}

fn set_read_only(path: &Path, read_only: bool) -> FsResult<()> {
    let metadata = fs::metadata(path).map_err(|e| FsError::io(path, e))?;
    let mut permissions = metadata.permissions();
    if permissions.readonly() == read_only {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        permissions.set_mode(if read_only { mode & !0o222 } else { mode | 0o200 });
    }

    #[cfg(not(unix))]
    permissions.set_readonly(read_only);

    fs::set_permissions(path, permissions).map_err(|e| FsError::io(path, e))
}

impl DirectoryReader for LocalFileSystem {
    fn read_directory_info(&self, path: &Path) -> FsResult<Vec<ItemInfo>> {
        self.read_directory_batched(path).map(|(entries, _)| entries)
    }

    fn get_attributes(&self, path: &Path) -> FsResult<ItemInfo> {
        let metadata = fs::symlink_metadata(path).map_err(|e| FsError::io(path, e))?;
        describe(path, &metadata)
    }

    fn get_directory_size(&self, path: &Path, control: &WalkControl<'_>) -> FsResult<SizeTotals> {
        let metadata = fs::symlink_metadata(path).map_err(|e| FsError::io(path, e))?;
        if metadata.file_type().is_symlink() {
            return Ok(SizeTotals::single_file(0));
        }
        if !metadata.is_dir() {
            return Ok(SizeTotals::single_file(metadata.len()));
        }

        let walker = WalkDir::new(path)
            .skip_hidden(false)
            .follow_links(false)
            .min_depth(1);

        let mut totals = SizeTotals::new();
        let mut seen: u64 = 0;
        for entry_result in walker {
            let entry = match entry_result {
                Ok(e) => e,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable entry while sizing");
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                totals.record_dir();
            } else if file_type.is_symlink() {
                totals.record_file(0);
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                totals.record_file(size);
            }

            seen += 1;
            if seen % PROGRESS_INTERVAL == 0 {
                control.checkpoint()?;
                control.report(&totals);
            }
        }

        control.checkpoint()?;
        control.report(&totals);
        Ok(totals)
    }
}

/// Reader over a local file.
struct LocalFileReader {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileReader for LocalFileReader {
    fn read_chunk(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        self.file.read(buf).map_err(|e| FsError::io(&self.path, e))
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Writes to a hidden sibling and publishes it as the target on commit.
struct LocalFileWriter {
    target: PathBuf,
    temp: PathBuf,
    file: Option<File>,
    options: WriteOptions,
    /// The temp file was renamed into place or removed.
    done: bool,
}

impl LocalFileWriter {
    fn discard(&mut self) {
        self.file.take();
        self.done = true;
        match fs::remove_file(&self.temp) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.temp.display(), error = %err, "Failed to remove partial file");
            }
        }
    }

    /// Move the finished temp file to the target.
    fn publish(&self) -> FsResult<()> {
        if !self.options.overwrite {
            // A hard link never replaces an existing target.
            match fs::hard_link(&self.temp, &self.target) {
                Ok(()) => {
                    if let Err(err) = fs::remove_file(&self.temp) {
                        warn!(path = %self.temp.display(), error = %err, "Failed to remove partial file");
                    }
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(FsError::AlreadyExists {
                        path: self.target.clone(),
                    });
                }
                // No hard links here (FAT, some network shares). The checked
                // rename below can still lose a race with a concurrent creator.
                Err(err) => {
                    debug!(path = %self.target.display(), error = %err, "Hard link unavailable, renaming");
                }
            }
        }

        check_target(&self.target, self.options)?;
        if self.options.replace_read_only && self.target.exists() {
            set_read_only(&self.target, false)?;
        }
        fs::rename(&self.temp, &self.target).map_err(|err| FsError::io(&self.target, err))
    }
}

impl FileWriter for LocalFileWriter {
    fn write_chunk(&mut self, data: &[u8]) -> FsResult<()> {
        let file = self.file.as_mut().ok_or(FsError::Cancelled)?;
        file.write_all(data).map_err(|e| FsError::io(&self.temp, e))
    }

    fn commit(mut self: Box<Self>) -> FsResult<()> {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.sync_all() {
                self.discard();
                return Err(FsError::io(&self.temp, err));
            }
        }

        match self.publish() {
            Ok(()) => {
                self.done = true;
                Ok(())
            }
            Err(err) => {
                self.discard();
                Err(err)
            }
        }
    }

    fn abort(mut self: Box<Self>) {
        self.discard();
    }
}

impl Drop for LocalFileWriter {
    fn drop(&mut self) {
        if !self.done {
            self.discard();
        }
    }
}

/// Check whether `target` may be replaced under `options`.
fn check_target(target: &Path, options: WriteOptions) -> FsResult<()> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(m) => m,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(FsError::io(target, err)),
    };

    if !options.overwrite {
        return Err(FsError::AlreadyExists {
            path: target.to_path_buf(),
        });
    }
    // A file never replaces a directory, even with overwrite on.
    if metadata.is_dir() {
        return Err(FsError::AlreadyExists {
            path: target.to_path_buf(),
        });
    }
    if metadata.permissions().readonly() && !options.replace_read_only {
        return Err(FsError::ReadOnly {
            path: target.to_path_buf(),
        });
    }
    Ok(())
}

impl FileIo for LocalFileSystem {
    fn create_file_reader(&self, path: &Path) -> FsResult<Box<dyn FileReader>> {
        let file = File::open(path).map_err(|e| FsError::io(path, e))?;
        let size = file.metadata().map_err(|e| FsError::io(path, e))?.len();
        Ok(Box::new(LocalFileReader {
            path: path.to_path_buf(),
            file,
            size,
        }))
    }

    fn create_file_writer(
        &self,
        path: &Path,
        options: WriteOptions,
    ) -> FsResult<Box<dyn FileWriter>> {
        check_target(path, options)?;
        let temp = self.temp_path_for(path);
        let file = File::create(&temp).map_err(|e| FsError::io(path, e))?;
        Ok(Box::new(LocalFileWriter {
            target: path.to_path_buf(),
            temp,
            file: Some(file),
            options,
            done: false,
        }))
    }

    fn get_file_basic_information(&self, path: &Path) -> FsResult<FileBasicInfo> {
        let metadata = fs::symlink_metadata(path).map_err(|e| FsError::io(path, e))?;
        Ok(FileBasicInfo {
            timestamps: timestamps_of(&metadata),
            attributes: attributes_of(path, &metadata),
        })
    }

    fn set_file_basic_information(&self, path: &Path, info: &FileBasicInfo) -> FsResult<()> {
        let modified = FileTime::from_system_time(info.timestamps.modified);
        let accessed = info
            .timestamps
            .accessed
            .map(FileTime::from_system_time)
            .unwrap_or(modified);
        filetime::set_file_times(path, accessed, modified).map_err(|e| FsError::io(path, e))?;
        set_read_only(path, info.is_read_only())
    }
}

impl DirectoryOperations for LocalFileSystem {
    fn create_directory(&self, path: &Path) -> FsResult<()> {
        fs::create_dir(path).map_err(|e| FsError::io(path, e))
    }

    fn delete_item(&self, path: &Path, flags: OperationFlags) -> FsResult<()> {
        let metadata = fs::symlink_metadata(path).map_err(|e| FsError::io(path, e))?;

        if flags.contains(OperationFlags::USE_RECYCLE_BIN) {
            return trash::delete(path).map_err(|e| FsError::backend(path, e.to_string()));
        }

        let file_type = metadata.file_type();
        if !file_type.is_symlink() && metadata.permissions().readonly() {
            if !flags.contains(OperationFlags::ALLOW_REPLACE_READONLY) {
                return Err(FsError::ReadOnly {
                    path: path.to_path_buf(),
                });
            }
            set_read_only(path, false)?;
        }

        let result = if file_type.is_dir() {
            if flags.contains(OperationFlags::RECURSIVE) {
                fs::remove_dir_all(path)
            } else {
                fs::remove_dir(path)
            }
        } else if file_type.is_symlink() && is_directory_link(&metadata) {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| FsError::io(path, e))
    }

    fn rename_item(&self, from: &Path, to: &Path, flags: OperationFlags) -> FsResult<()> {
        if !flags.contains(OperationFlags::ALLOW_OVERWRITE) && fs::symlink_metadata(to).is_ok() {
            return Err(FsError::AlreadyExists {
                path: to.to_path_buf(),
            });
        }
        fs::rename(from, to).map_err(|e| FsError::io(from, e))
    }

    fn supports_recycle_bin(&self) -> bool {
        true
    }
}

#[cfg(windows)]
fn is_directory_link(metadata: &Metadata) -> bool {
    use std::os::windows::fs::FileTypeExt;
    metadata.file_type().is_symlink_dir()
}

#[cfg(not(windows))]
fn is_directory_link(_metadata: &Metadata) -> bool {
    false
}

impl ReparseLink for LocalFileSystem {
    fn read_link(&self, path: &Path) -> FsResult<Option<LinkInfo>> {
        let metadata = fs::symlink_metadata(path).map_err(|e| FsError::io(path, e))?;
        if !metadata.file_type().is_symlink() {
            return Ok(None);
        }
        let target = fs::read_link(path).map_err(|e| FsError::io(path, e))?;
        Ok(Some(LinkInfo {
            kind: link_kind(path, &metadata),
            target,
        }))
    }

    #[cfg(unix)]
    fn create_link(&self, path: &Path, _kind: LinkKind, target: &Path) -> FsResult<()> {
        std::os::unix::fs::symlink(target, path).map_err(|e| FsError::io(path, e))
    }

    #[cfg(windows)]
    fn create_link(&self, path: &Path, kind: LinkKind, target: &Path) -> FsResult<()> {
        let result = if kind.is_directory() {
            std::os::windows::fs::symlink_dir(target, path)
        } else {
            std::os::windows::fs::symlink_file(target, path)
        };
        result.map_err(|e| FsError::io(path, e))
    }

    #[cfg(not(any(unix, windows)))]
    fn create_link(&self, _path: &Path, _kind: LinkKind, _target: &Path) -> FsResult<()> {
        Err(FsError::NotSupported {
            operation: "create_link",
        })
    }
}

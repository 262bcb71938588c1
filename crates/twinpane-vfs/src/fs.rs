//! Backend capability traits.
//!
//! A backend implements [`FileSystem`] and exposes each responsibility it
//! supports through a capability probe. The engine asks for the capability it
//! needs and rejects a request up front when a probe returns `None`.
//!
//! All calls are synchronous and may block on I/O; the engine runs them on
//! the blocking pool.

use std::path::Path;

use twinpane_core::{
    FileBasicInfo, FsError, FsResult, ItemInfo, LinkInfo, LinkKind, OperationFlags, SizeTotals,
};

use crate::size::{WalkControl, walk_size};
use crate::watch::{WatchId, WatchSubscription};

/// A pluggable virtual file system.
pub trait FileSystem: Send + Sync {
    /// Display name (e.g. "Local disk").
    fn name(&self) -> &str;

    /// Identity of the backend instance. Two handles with the same id address
    /// the same namespace, so renames between them are possible.
    fn id(&self) -> &str;

    fn reader(&self) -> Option<&dyn DirectoryReader> {
        None
    }

    fn io(&self) -> Option<&dyn FileIo> {
        None
    }

    fn operations(&self) -> Option<&dyn DirectoryOperations> {
        None
    }

    fn watch(&self) -> Option<&dyn DirectoryWatch> {
        None
    }

    fn links(&self) -> Option<&dyn ReparseLink> {
        None
    }
}

/// Listing and metadata queries.
pub trait DirectoryReader: Send + Sync {
    /// List the entries of a directory. Links are reported, not followed.
    fn read_directory_info(&self, path: &Path) -> FsResult<Vec<ItemInfo>>;

    /// Describe a single item without following links.
    fn get_attributes(&self, path: &Path) -> FsResult<ItemInfo>;

    /// Free-form item properties for the UI's property sheet.
    fn get_item_properties(&self, path: &Path) -> FsResult<serde_json::Value> {
        let item = self.get_attributes(path)?;
        let modified = item
            .basic
            .timestamps
            .modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(serde_json::json!({
            "name": item.name.as_str(),
            "path": item.path.to_string_lossy(),
            "kind": match &item.kind {
                twinpane_core::ItemKind::File => "file".to_string(),
                twinpane_core::ItemKind::Directory => "directory".to_string(),
                twinpane_core::ItemKind::Link(link) => link.kind.to_string(),
            },
            "size": item.size,
            "readOnly": item.is_read_only(),
            "modified": modified,
            "linkTarget": item.kind.link().map(|l| l.target.to_string_lossy().into_owned()),
        }))
    }

    /// Total bytes, files and directories under `path`.
    ///
    /// A file root yields `{ size, 1, 0 }` without walking. Links are counted
    /// as zero-byte files and never followed.
    fn get_directory_size(&self, path: &Path, control: &WalkControl<'_>) -> FsResult<SizeTotals> {
        walk_size(self, path, control)
    }
}

/// Options for [`FileIo::create_file_writer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replace an existing file.
    pub overwrite: bool,
    /// Replace an existing file even when it is read-only.
    pub replace_read_only: bool,
}

impl WriteOptions {
    pub fn from_flags(flags: OperationFlags) -> Self {
        Self {
            overwrite: flags.contains(OperationFlags::ALLOW_OVERWRITE),
            replace_read_only: flags.contains(OperationFlags::ALLOW_REPLACE_READONLY),
        }
    }
}

/// Sequential reader over one file.
pub trait FileReader: Send {
    /// Fill `buf` with the next bytes; returns 0 at end of file.
    fn read_chunk(&mut self, buf: &mut [u8]) -> FsResult<usize>;

    /// Size of the file when the reader was opened.
    fn size(&self) -> u64;
}

/// Sequential writer that only makes the file visible under its final name
/// on [`FileWriter::commit`].
pub trait FileWriter: Send {
    fn write_chunk(&mut self, data: &[u8]) -> FsResult<()>;

    /// Publish the written bytes under the target name.
    fn commit(self: Box<Self>) -> FsResult<()>;

    /// Discard everything written so far.
    fn abort(self: Box<Self>);
}

/// Byte streams and basic information.
pub trait FileIo: Send + Sync {
    fn create_file_reader(&self, path: &Path) -> FsResult<Box<dyn FileReader>>;

    /// Open a writer for `path`.
    ///
    /// Fails with `AlreadyExists` when the target exists and overwriting is
    /// off or when the target is a directory, `ReadOnly` when it is read-only and replacing read-only items is
    /// off, and `SharingViolation` when it is locked.
    fn create_file_writer(&self, path: &Path, options: WriteOptions)
    -> FsResult<Box<dyn FileWriter>>;

    fn get_file_basic_information(&self, path: &Path) -> FsResult<FileBasicInfo>;

    fn set_file_basic_information(&self, path: &Path, info: &FileBasicInfo) -> FsResult<()>;
}

/// Namespace mutations.
pub trait DirectoryOperations: Send + Sync {
    /// Create one directory. The parent must exist.
    fn create_directory(&self, path: &Path) -> FsResult<()>;

    /// Delete a file, link or directory.
    ///
    /// Directories are removed with their contents only when `RECURSIVE` is
    /// set. `USE_RECYCLE_BIN` moves the item to the recycle bin instead.
    /// Read-only items need `ALLOW_REPLACE_READONLY`.
    fn delete_item(&self, path: &Path, flags: OperationFlags) -> FsResult<()>;

    /// Rename within this backend. `ALLOW_OVERWRITE` replaces an existing target.
    fn rename_item(&self, from: &Path, to: &Path, flags: OperationFlags) -> FsResult<()>;

    fn supports_recycle_bin(&self) -> bool {
        false
    }
}

/// Change notifications for a watched directory.
pub trait DirectoryWatch: Send + Sync {
    /// Start watching `path`. At most `capacity` changes are buffered; when
    /// the consumer falls behind the next delivered change has `overflow` set.
    fn watch_directory(&self, path: &Path, capacity: usize) -> FsResult<WatchSubscription>;

    fn unwatch_directory(&self, id: WatchId) -> FsResult<()>;
}

/// Reading and creating reparse points.
pub trait ReparseLink: Send + Sync {
    /// The link at `path`, or `None` when `path` is not a link.
    fn read_link(&self, path: &Path) -> FsResult<Option<LinkInfo>>;

    fn create_link(&self, path: &Path, kind: LinkKind, target: &Path) -> FsResult<()>;
}

/// Probe a capability, turning its absence into a typed error.
pub fn require<'a, T: ?Sized>(capability: Option<&'a T>, name: &'static str) -> FsResult<&'a T> {
    capability.ok_or(FsError::NotSupported { operation: name })
}

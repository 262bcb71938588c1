//! Directory entry descriptions shared by every backend.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bitflags::bitflags;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Timestamps of a file system item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    /// Last modification time.
    pub modified: SystemTime,
    /// Last access time (if available).
    pub accessed: Option<SystemTime>,
    /// Creation time (if available, platform-dependent).
    pub created: Option<SystemTime>,
}

impl Timestamps {
    /// Create timestamps with only modified time.
    pub fn with_modified(modified: SystemTime) -> Self {
        Self {
            modified,
            accessed: None,
            created: None,
        }
    }

    /// Create timestamps with all available times.
    pub fn new(
        modified: SystemTime,
        accessed: Option<SystemTime>,
        created: Option<SystemTime>,
    ) -> Self {
        Self {
            modified,
            accessed,
            created,
        }
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::with_modified(SystemTime::UNIX_EPOCH)
    }
}

bitflags! {
    /// Portable subset of item attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 1 << 0;
        const HIDDEN = 1 << 1;
        const SYSTEM = 1 << 2;
        const ARCHIVE = 1 << 3;
    }
}

/// Timestamps plus attributes, carried across backends on copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBasicInfo {
    pub timestamps: Timestamps,
    pub attributes: FileAttributes,
}

impl FileBasicInfo {
    pub fn is_read_only(&self) -> bool {
        self.attributes.contains(FileAttributes::READ_ONLY)
    }
}

/// Flavour of a reparse point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkKind {
    FileSymlink,
    DirectorySymlink,
    Junction,
}

impl LinkKind {
    /// Whether the link stands in for a directory.
    pub fn is_directory(self) -> bool {
        matches!(self, Self::DirectorySymlink | Self::Junction)
    }
}

/// A reparse point as read from a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub kind: LinkKind,
    /// Target exactly as stored in the link.
    pub target: PathBuf,
}

/// What an item is, without following links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    File,
    Directory,
    Link(LinkInfo),
}

impl ItemKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File)
    }

    pub fn link(&self) -> Option<&LinkInfo> {
        match self {
            Self::Link(info) => Some(info),
            _ => None,
        }
    }
}

/// One entry returned by a directory listing or an attribute query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    /// Entry name (last path component).
    pub name: CompactString,
    /// Full path on the owning backend.
    pub path: PathBuf,
    pub kind: ItemKind,
    /// Size in bytes; zero for directories and links.
    pub size: u64,
    pub basic: FileBasicInfo,
}

impl ItemInfo {
    /// Build an entry, deriving the name from the path.
    pub fn new(path: impl Into<PathBuf>, kind: ItemKind, size: u64, basic: FileBasicInfo) -> Self {
        let path = path.into();
        let name = item_name(&path);
        Self {
            name,
            path,
            kind,
            size,
            basic,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_read_only(&self) -> bool {
        self.basic.is_read_only()
    }
}

/// Last component of a path as a compact string.
pub fn item_name(path: &Path) -> CompactString {
    path.file_name()
        .map(|n| CompactString::from(n.to_string_lossy()))
        .unwrap_or_else(|| CompactString::from(path.to_string_lossy()))
}

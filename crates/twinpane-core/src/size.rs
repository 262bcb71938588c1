//! Size totals produced by directory sizing.

use serde::{Deserialize, Serialize};

/// Byte, file and directory totals under a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeTotals {
    /// Total size in bytes.
    pub total_bytes: u64,
    /// Files (and links) found.
    pub file_count: u64,
    /// Directories found, not counting the root being sized.
    pub directory_count: u64,
}

impl SizeTotals {
    /// Create new empty totals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals for a single file root.
    pub fn single_file(size: u64) -> Self {
        Self {
            total_bytes: size,
            file_count: 1,
            directory_count: 0,
        }
    }

    /// Record a file entry.
    pub fn record_file(&mut self, size: u64) {
        self.file_count += 1;
        self.total_bytes += size;
    }

    /// Record a directory.
    pub fn record_dir(&mut self) {
        self.directory_count += 1;
    }

    /// Add another set of totals to this one.
    pub fn merge(&mut self, other: &SizeTotals) {
        self.total_bytes += other.total_bytes;
        self.file_count += other.file_count;
        self.directory_count += other.directory_count;
    }

    /// Files plus directories.
    pub fn item_count(&self) -> u64 {
        self.file_count + self.directory_count
    }
}

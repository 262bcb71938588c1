//! Virtual file system backends for twinpane.
//!
//! The operations engine never touches `std::fs` directly. It talks to a
//! [`FileSystem`] and asks for the capabilities it needs:
//!
//! - [`DirectoryReader`]: listings, attributes, properties and sizing
//! - [`FileIo`]: chunked readers and atomic writers, basic information
//! - [`DirectoryOperations`]: create, delete (optionally to the recycle bin), rename
//! - [`DirectoryWatch`]: bounded change notifications with an overflow flag
//! - [`ReparseLink`]: reading and creating links
//!
//! Two backends ship with the crate: [`LocalFileSystem`] for the machine's
//! own disk and [`InMemoryFileSystem`], a synthetic backend used by tests
//! and the self-test suite.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use twinpane_vfs::{FileSystem, LocalFileSystem, WalkControl};
//!
//! let local = LocalFileSystem::new();
//! let reader = local.reader().unwrap();
//! let totals = reader
//!     .get_directory_size(Path::new("/path/to/size"), &WalkControl::none())
//!     .unwrap();
//!
//! println!("{} bytes in {} files", totals.total_bytes, totals.file_count);
//! ```

mod fs;
mod local;
mod memory;
mod size;
mod watch;

pub use fs::{
    DirectoryOperations, DirectoryReader, DirectoryWatch, FileIo, FileReader, FileSystem,
    FileWriter, ReparseLink, WriteOptions, require,
};
pub use local::{DEFAULT_ENUMERATION_BUFFER, ListingStats, LocalFileSystem};
pub use memory::{InMemoryFileSystem, synthetic_byte};
pub use size::{PROGRESS_INTERVAL, WalkControl, walk_size};
pub use watch::{ChangeKind, DirectoryChange, WatchId, WatchRegistry, WatchSubscription};

// Re-export core types for convenience
pub use twinpane_core::{FsError, FsResult, ItemInfo, ItemKind, LinkInfo, LinkKind, SizeTotals};

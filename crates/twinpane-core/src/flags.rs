//! Operation flag bitset passed to the engine and to backends.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags controlling a copy, move or delete request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OperationFlags: u32 {
        /// Descend into directories.
        const RECURSIVE = 1 << 0;
        /// Replace existing destination items.
        const ALLOW_OVERWRITE = 1 << 1;
        /// Replace destination items marked read-only.
        const ALLOW_REPLACE_READONLY = 1 << 2;
        /// Skip failing items instead of aborting the task.
        const CONTINUE_ON_ERROR = 1 << 3;
        /// Send deleted items to the recycle bin.
        const USE_RECYCLE_BIN = 1 << 4;
    }
}

impl OperationFlags {
    /// Flags the file manager uses for an ordinary user-initiated transfer.
    pub const fn standard() -> Self {
        Self::RECURSIVE
    }

    /// Describe the flags as a short list for logs and reports.
    pub fn describe(self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase().replace('_', "-"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

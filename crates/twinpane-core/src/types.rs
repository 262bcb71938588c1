//! Small identifiers and enums shared across the engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier of a task for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source; one per orchestrator.
#[derive(Debug)]
pub struct TaskIdGenerator {
    next: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// File operation performed by a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
}

impl OperationKind {
    /// Whether the operation writes to a destination folder.
    pub fn needs_destination(self) -> bool {
        matches!(self, Self::Copy | Self::Move)
    }
}

/// How the items of a task are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ExecutionMode {
    /// All items run inside the task's own driver.
    #[default]
    BulkItems,
    /// Each item is scheduled independently on the shared pool.
    PerItem,
}

/// Which side of the dual-pane window a path came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Pane {
    #[default]
    Left,
    Right,
}

/// Handling of links met during copy and move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReparsePolicy {
    /// Recreate links at the destination.
    #[default]
    CopyReparse,
    /// Treat every link as a conflict the user can only skip.
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_monotonic() {
        let ids = TaskIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "#1");
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::Move.to_string(), "move");
        assert!(!OperationKind::Delete.needs_destination());
        assert_eq!(ReparsePolicy::CopyReparse.to_string(), "copy_reparse");
    }
}

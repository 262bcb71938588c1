//! Core types for twinpane.
//!
//! This crate provides the vocabulary shared by the backends and the
//! operations engine: result codes, backend errors, operation flags,
//! item metadata and engine configuration.

mod config;
mod error;
mod flags;
mod item;
mod size;
mod types;

pub use config::{ConfigError, EngineConfig, EngineConfigBuilder};
pub use error::{FsError, FsResult, ResultCode};
pub use flags::OperationFlags;
pub use item::{
    FileAttributes, FileBasicInfo, ItemInfo, ItemKind, LinkInfo, LinkKind, Timestamps, item_name,
};
pub use size::SizeTotals;
pub use types::{ExecutionMode, OperationKind, Pane, ReparsePolicy, TaskId, TaskIdGenerator};

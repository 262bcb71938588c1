//! Operation requests and their up-front validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use twinpane_core::{ExecutionMode, OperationFlags, OperationKind, Pane, ResultCode};
use twinpane_vfs::FileSystem;

/// Reasons a request is rejected before any task exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("No source paths given")]
    NoSources,

    #[error("A {kind} needs a destination folder")]
    MissingDestination { kind: OperationKind },

    #[error("Destination {} is inside or equal to source {}", .destination.display(), .source_path.display())]
    InvalidDestination {
        source_path: PathBuf,
        destination: PathBuf,
    },

    #[error("File system '{backend}' does not support {capability}")]
    MissingCapability {
        backend: String,
        capability: &'static str,
    },

    #[error("The operations engine is shutting down")]
    ShuttingDown,
}

impl RequestError {
    pub fn code(&self) -> ResultCode {
        match self {
            Self::NoSources | Self::MissingDestination { .. } | Self::InvalidDestination { .. } => {
                ResultCode::InvalidArgument
            }
            Self::MissingCapability { .. } => ResultCode::NotSupported,
            Self::ShuttingDown => ResultCode::Aborted,
        }
    }
}

/// A copy, move or delete request as handed to
/// [`crate::FileOperationState::start_operation`].
#[derive(Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub source_pane: Pane,
    pub destination_pane: Pane,
    /// Backend of the sources (and of the destination unless
    /// `destination_file_system` is set).
    pub file_system: Arc<dyn FileSystem>,
    pub sources: Vec<PathBuf>,
    pub destination: Option<PathBuf>,
    pub flags: OperationFlags,
    /// Wait for every earlier task even in parallel queue mode.
    pub wait_for_others: bool,
    /// Bytes per second, 0 for unlimited.
    pub speed_limit: u64,
    pub execution_mode: ExecutionMode,
    /// Surface recoverable conflicts as prompts instead of resolving them
    /// from the flags.
    pub require_confirmation: bool,
    pub destination_file_system: Option<Arc<dyn FileSystem>>,
}

impl std::fmt::Debug for OperationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRequest")
            .field("kind", &self.kind)
            .field("file_system", &self.file_system.id())
            .field("sources", &self.sources)
            .field("destination", &self.destination)
            .field("flags", &self.flags)
            .field("execution_mode", &self.execution_mode)
            .field("require_confirmation", &self.require_confirmation)
            .field(
                "destination_file_system",
                &self.destination_file_system.as_ref().map(|fs| fs.id()),
            )
            .finish_non_exhaustive()
    }
}

impl OperationRequest {
    fn new(
        kind: OperationKind,
        file_system: Arc<dyn FileSystem>,
        sources: Vec<PathBuf>,
        destination: Option<PathBuf>,
    ) -> Self {
        Self {
            kind,
            source_pane: Pane::Left,
            destination_pane: Pane::Right,
            file_system,
            sources,
            destination,
            flags: OperationFlags::standard(),
            wait_for_others: false,
            speed_limit: 0,
            execution_mode: ExecutionMode::default(),
            require_confirmation: false,
            destination_file_system: None,
        }
    }

    /// Create a copy request.
    pub fn copy(
        file_system: Arc<dyn FileSystem>,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            OperationKind::Copy,
            file_system,
            sources,
            Some(destination.into()),
        )
    }

    /// Create a move request.
    pub fn move_to(
        file_system: Arc<dyn FileSystem>,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            OperationKind::Move,
            file_system,
            sources,
            Some(destination.into()),
        )
    }

    /// Create a delete request.
    pub fn delete(file_system: Arc<dyn FileSystem>, sources: Vec<PathBuf>) -> Self {
        Self::new(OperationKind::Delete, file_system, sources, None)
    }

    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_panes(mut self, source: Pane, destination: Pane) -> Self {
        self.source_pane = source;
        self.destination_pane = destination;
        self
    }

    pub fn wait_for_others(mut self, wait: bool) -> Self {
        self.wait_for_others = wait;
        self
    }

    pub fn with_speed_limit(mut self, bytes_per_second: u64) -> Self {
        self.speed_limit = bytes_per_second;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn require_confirmation(mut self, interactive: bool) -> Self {
        self.require_confirmation = interactive;
        self
    }

    pub fn with_destination_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.destination_file_system = Some(file_system);
        self
    }

    /// Backend the destination lives on.
    pub fn destination_fs(&self) -> &Arc<dyn FileSystem> {
        self.destination_file_system
            .as_ref()
            .unwrap_or(&self.file_system)
    }

    /// Whether source and destination are different namespaces.
    pub fn is_cross_backend(&self) -> bool {
        self.destination_fs().id() != self.file_system.id()
    }

    /// Reject requests that cannot work. Does no I/O.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.sources.is_empty() {
            return Err(RequestError::NoSources);
        }

        if self.kind.needs_destination() {
            let destination = self
                .destination
                .as_deref()
                .ok_or(RequestError::MissingDestination { kind: self.kind })?;
            if !self.is_cross_backend() {
                for source in &self.sources {
                    self.check_nesting(source, destination)?;
                }
            }
        }

        self.check_capabilities()
    }

    fn check_nesting(&self, source: &Path, destination: &Path) -> Result<(), RequestError> {
        let invalid = || RequestError::InvalidDestination {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
        };
        if destination.starts_with(source) {
            return Err(invalid());
        }
        // Moving an item into the folder it already lives in would target itself.
        if self.kind == OperationKind::Move && source.parent() == Some(destination) {
            return Err(invalid());
        }
        Ok(())
    }

    fn check_capabilities(&self) -> Result<(), RequestError> {
        let missing = |fs: &Arc<dyn FileSystem>, capability: &'static str| {
            RequestError::MissingCapability {
                backend: fs.name().to_string(),
                capability,
            }
        };
        let source = &self.file_system;
        let destination = self.destination_fs();

        if source.reader().is_none() {
            return Err(missing(source, "directory listing"));
        }

        match self.kind {
            OperationKind::Copy | OperationKind::Move => {
                if source.io().is_none() {
                    return Err(missing(source, "file reading"));
                }
                if destination.reader().is_none() {
                    return Err(missing(destination, "directory listing"));
                }
                if destination.io().is_none() {
                    return Err(missing(destination, "file writing"));
                }
                if destination.operations().is_none() {
                    return Err(missing(destination, "directory operations"));
                }
                if self.kind == OperationKind::Move && source.operations().is_none() {
                    return Err(missing(source, "deleting moved items"));
                }
            }
            OperationKind::Delete => {
                let Some(operations) = source.operations() else {
                    return Err(missing(source, "directory operations"));
                };
                if self.flags.contains(OperationFlags::USE_RECYCLE_BIN)
                    && !operations.supports_recycle_bin()
                {
                    return Err(missing(source, "the recycle bin"));
                }
            }
        }
        Ok(())
    }
}

//! Explicit application context handed to the engine.

use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime, TryCurrentError};

use twinpane_core::EngineConfig;

use crate::diagnostics::DiagnosticsLog;

/// Configuration, runtime handle and diagnostics sink for one engine.
///
/// Owned by the process entry point and passed to
/// [`crate::FileOperationState::new`]; nothing in the engine reaches for a
/// global instead.
#[derive(Debug, Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    handle: Handle,
    diagnostics: Option<Arc<DiagnosticsLog>>,
}

impl EngineContext {
    pub fn new(config: EngineConfig, handle: Handle) -> Self {
        Self {
            config: Arc::new(config),
            handle,
            diagnostics: None,
        }
    }

    /// Context on the runtime the caller is running in.
    pub fn current(config: EngineConfig) -> Result<Self, TryCurrentError> {
        Ok(Self::new(config, Handle::try_current()?))
    }

    /// Append every finished task to `log`.
    pub fn with_diagnostics_log(mut self, log: DiagnosticsLog) -> Self {
        self.diagnostics = Some(Arc::new(log));
        self
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn diagnostics_log(&self) -> Option<&Arc<DiagnosticsLog>> {
        self.diagnostics.as_ref()
    }
}

/// Build the shared multi-threaded runtime sized by `config`.
pub fn build_runtime(config: &EngineConfig) -> std::io::Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("twinpane-worker")
        .max_blocking_threads(config.max_blocking_threads.max(1));
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_from_config() {
        let config = EngineConfig::builder()
            .worker_threads(2usize)
            .max_blocking_threads(4usize)
            .build()
            .unwrap();
        let runtime = build_runtime(&config).unwrap();
        let context = EngineContext::new(config, runtime.handle().clone());
        assert_eq!(context.config().worker_threads, 2);
        assert!(context.diagnostics_log().is_none());
    }

    #[test]
    fn test_current_needs_a_runtime() {
        assert!(EngineContext::current(EngineConfig::default()).is_err());
    }
}

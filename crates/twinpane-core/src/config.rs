//! Engine configuration types.

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flags::OperationFlags;
use crate::types::{OperationKind, ReparsePolicy};

const CONFIG_DIR_NAME: &str = "twinpane";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A knob has an unusable value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for the file operations engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EngineConfig {
    /// Items of one copy/move task in flight at once.
    #[builder(default = "4")]
    pub copy_move_max_concurrency: usize,

    /// Items of one delete task in flight at once.
    #[builder(default = "8")]
    pub delete_max_concurrency: usize,

    /// Items of one recycle-bin delete task in flight at once.
    #[builder(default = "1")]
    pub delete_recycle_bin_max_concurrency: usize,

    /// Items in flight across all per-item tasks.
    #[builder(default = "16")]
    pub shared_item_budget: usize,

    /// Tasks allowed to size their sources at the same time.
    #[builder(default = "2")]
    pub max_concurrent_precalc: usize,

    /// Bytes moved per read/write round trip.
    #[builder(default = "1024 * 1024")]
    pub chunk_size: usize,

    /// How links met during copy or move are handled.
    #[builder(default)]
    pub reparse_policy: ReparsePolicy,

    /// Start in "wait" queue mode.
    #[builder(default = "false")]
    pub wait_for_others: bool,

    /// Drop summaries of successful tasks as soon as they finish.
    #[builder(default = "false")]
    pub auto_dismiss_success: bool,

    /// Completed-task summaries kept for diagnostics.
    #[builder(default = "64")]
    pub max_retained_summaries: usize,

    /// Issues recorded per task before further ones are only counted.
    #[builder(default = "1000")]
    pub max_issues_per_task: usize,

    /// Runtime worker threads (0 = one per core).
    #[builder(default = "0")]
    pub worker_threads: usize,

    /// Upper bound for the blocking I/O pool.
    #[builder(default = "64")]
    pub max_blocking_threads: usize,

    /// Directory for rotating log files.
    #[builder(default = "default_log_dir()")]
    pub log_dir: PathBuf,

    /// Directory for exported issues reports.
    #[builder(default = "default_report_dir()")]
    pub report_dir: PathBuf,

    /// Rotated log files kept on disk.
    #[builder(default = "14")]
    pub max_log_files: usize,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR_NAME)
}

fn default_log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn default_report_dir() -> PathBuf {
    data_dir().join("reports")
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let knobs = [
            ("copy_move_max_concurrency", self.copy_move_max_concurrency),
            ("delete_max_concurrency", self.delete_max_concurrency),
            (
                "delete_recycle_bin_max_concurrency",
                self.delete_recycle_bin_max_concurrency,
            ),
            ("shared_item_budget", self.shared_item_budget),
            ("max_concurrent_precalc", self.max_concurrent_precalc),
            ("chunk_size", self.chunk_size),
            ("max_retained_summaries", self.max_retained_summaries),
            ("max_log_files", self.max_log_files),
        ];
        for (name, value) in knobs {
            if value == Some(0) {
                return Err(format!("{name} must be greater than zero"));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            copy_move_max_concurrency: 4,
            delete_max_concurrency: 8,
            delete_recycle_bin_max_concurrency: 1,
            shared_item_budget: 16,
            max_concurrent_precalc: 2,
            chunk_size: 1024 * 1024,
            reparse_policy: ReparsePolicy::default(),
            wait_for_others: false,
            auto_dismiss_success: false,
            max_retained_summaries: 64,
            max_issues_per_task: 1000,
            worker_threads: 0,
            max_blocking_threads: 64,
            log_dir: default_log_dir(),
            report_dir: default_report_dir(),
            max_log_files: 14,
        }
    }
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Load the user's config file, or defaults when there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Check knob ranges on an already-built config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let builder = EngineConfigBuilder {
            copy_move_max_concurrency: Some(self.copy_move_max_concurrency),
            delete_max_concurrency: Some(self.delete_max_concurrency),
            delete_recycle_bin_max_concurrency: Some(self.delete_recycle_bin_max_concurrency),
            shared_item_budget: Some(self.shared_item_budget),
            max_concurrent_precalc: Some(self.max_concurrent_precalc),
            chunk_size: Some(self.chunk_size),
            max_retained_summaries: Some(self.max_retained_summaries),
            max_log_files: Some(self.max_log_files),
            ..EngineConfigBuilder::default()
        };
        builder.validate().map_err(ConfigError::Invalid)
    }

    /// Per-task item concurrency for an operation.
    pub fn concurrency_for(&self, kind: OperationKind, flags: OperationFlags) -> usize {
        match kind {
            OperationKind::Copy | OperationKind::Move => self.copy_move_max_concurrency,
            OperationKind::Delete if flags.contains(OperationFlags::USE_RECYCLE_BIN) => {
                self.delete_recycle_bin_max_concurrency
            }
            OperationKind::Delete => self.delete_max_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .copy_move_max_concurrency(8usize)
            .reparse_policy(ReparsePolicy::Skip)
            .build()
            .unwrap();

        assert_eq!(config.copy_move_max_concurrency, 8);
        assert_eq!(config.delete_max_concurrency, 8);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.reparse_policy, ReparsePolicy::Skip);
    }

    #[test]
    fn test_config_rejects_zero_knobs() {
        let err = EngineConfig::builder()
            .copy_move_max_concurrency(0usize)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("copy_move_max_concurrency"));

        let err = EngineConfig::from_toml("chunk_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_concurrency_for() {
        let config = EngineConfig::default();
        assert_eq!(
            config.concurrency_for(OperationKind::Copy, OperationFlags::empty()),
            4
        );
        assert_eq!(
            config.concurrency_for(OperationKind::Delete, OperationFlags::empty()),
            8
        );
        assert_eq!(
            config.concurrency_for(OperationKind::Delete, OperationFlags::USE_RECYCLE_BIN),
            1
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            "delete_max_concurrency = 3\nreparse_policy = \"skip\"\n",
        )
        .unwrap();
        assert_eq!(config.delete_max_concurrency, 3);
        assert_eq!(config.copy_move_max_concurrency, 4);
        assert_eq!(config.reparse_policy, ReparsePolicy::Skip);
    }
}

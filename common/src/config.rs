//! Configuration types for runtime and execution settings

use anyhow::Context;

use crate::skeleton::ValidationMode;

/// Name of the configuration file picked up from the current directory.
pub const CONFIG_FILE_NAME: &str = "rb.json";

pub const DEFAULT_NUM_WORKERS: usize = 200;
pub const DEFAULT_QUEUE_LEN: usize = 200;
pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Backup job settings
#[derive(Debug, Clone, Copy)]
pub struct BackupConfig {
    /// Number of copy workers
    pub num_workers: usize,
    /// Capacity of the request and response channels
    pub queue_len: usize,
    /// Maximum number of files per batch
    pub batch_size: u64,
    pub dir_validation_mode: ValidationMode,
    /// Maximum number of concurrently open files (None = unlimited)
    pub max_open_files: Option<usize>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            queue_len: DEFAULT_QUEUE_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
            dir_validation_mode: ValidationMode::default(),
            max_open_files: None,
        }
    }
}

impl BackupConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.num_workers == 0 {
            return Err("number of workers must be greater than 0".to_string());
        }
        if self.queue_len == 0 {
            return Err("queue length must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch size must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Defaults overridden by whatever the configuration file sets.
    #[must_use]
    pub fn from_file(file: &ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            num_workers: file.num_workers.unwrap_or(defaults.num_workers),
            queue_len: file.queue_len.unwrap_or(defaults.queue_len),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            dir_validation_mode: file
                .dir_validation_mode
                .unwrap_or(defaults.dir_validation_mode),
            max_open_files: file.max_open_files.or(defaults.max_open_files),
        }
    }
}

/// Optional JSON configuration file; every field may be omitted.
///
/// ```json
/// { "num_workers": 64, "queue_len": 128, "batch_size": 500, "dir_validation_mode": "block" }
/// ```
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub num_workers: Option<usize>,
    pub queue_len: Option<usize>,
    pub batch_size: Option<u64>,
    pub dir_validation_mode: Option<ValidationMode>,
    pub max_open_files: Option<usize>,
    pub max_workers: Option<usize>,
    pub max_blocking_threads: Option<usize>,
}

impl ConfigFile {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {path:?}"))
    }

    /// Loads `path` if given, otherwise `rb.json` from the current directory when it exists.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let default_path = std::path::Path::new(CONFIG_FILE_NAME);
        if default_path.is_file() {
            return Self::from_file(default_path);
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BackupConfig::default();
        assert_eq!(config.num_workers, 200);
        assert_eq!(config.queue_len, 200);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.dir_validation_mode, ValidationMode::Report);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = BackupConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = BackupConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("rb.json");
        std::fs::write(&path, r#"{"num_workers": 8, "dir_validation_mode": "block"}"#).unwrap();
        let file = ConfigFile::load(Some(&path)).unwrap();
        let config = BackupConfig::from_file(&file);
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_len, DEFAULT_QUEUE_LEN);
        assert_eq!(config.dir_validation_mode, ValidationMode::Block);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("rb.json");
        std::fs::write(&path, r#"{"workers": 8}"#).unwrap();
        assert!(ConfigFile::load(Some(&path)).is_err());
        assert!(ConfigFile::load(Some(&tmp_dir.path().join("missing.json"))).is_err());
    }
}

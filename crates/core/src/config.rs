use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;
use crate::logging::DEFAULT_LOG_RETENTION_FILES;
use crate::recovery::RecoveryConfig;
use crate::types::{TileOptions, UpscaleParams};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILEUP_DATA_DIR";
const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tiling: TileOptions,
    pub recovery: RecoveryConfig,
    pub generation: UpscaleParams,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Number of daily log files kept under `<data_dir>/logs`.
    pub retention_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config TOML")
    }

    /// Reject settings no run could start with.
    pub fn validate(&self) -> Result<(), UpscaleError> {
        let tiling = &self.tiling;
        if tiling.tile_size == 0 {
            return Err(UpscaleError::Config("tiling.tile_size must be positive".into()));
        }
        if tiling.overlap >= tiling.tile_size {
            return Err(UpscaleError::Config(format!(
                "tiling.overlap ({}) must be smaller than tiling.tile_size ({})",
                tiling.overlap, tiling.tile_size
            )));
        }
        if tiling.scale_factor == 0 {
            return Err(UpscaleError::Config("tiling.scale_factor must be positive".into()));
        }
        if tiling.tile_batch_size == 0 {
            return Err(UpscaleError::Config(
                "tiling.tile_batch_size must be positive".into(),
            ));
        }
        if self.generation.callback_steps == 0 {
            return Err(UpscaleError::Config(
                "generation.callback_steps must be positive".into(),
            ));
        }
        if self.logging.retention_files == 0 {
            return Err(UpscaleError::Config(
                "logging.retention_files must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILEUP_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOGS_DIR_NAME)
}

/// Create `data_dir` if missing and write a default config.toml unless one
/// already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.tiling.tile_size, 128);
        assert_eq!(cfg.tiling.overlap, 16);
        assert_eq!(cfg.tiling.tile_batch_size, 2);
        assert_eq!(cfg.tiling.scale_factor, 4);
        assert_eq!(cfg.recovery.max_reductions, 4);
        assert_eq!(cfg.recovery.tile_size_decrement, 32);
        assert_eq!(cfg.recovery.min_tile_size, 64);
        assert_eq!(cfg.generation.steps, 30);
        assert_eq!(cfg.generation.noise_level, 20);
        assert_eq!(cfg.logging.retention_files, DEFAULT_LOG_RETENTION_FILES);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.generation.prompt = "sharp photo".to_string();
        original.tiling.tile_size = 256;
        let encoded = original.to_toml().expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let decoded: AppConfig =
            toml::from_str("[tiling]\ntile_size = 64\n").expect("deserialize partial config");
        assert_eq!(decoded.tiling.tile_size, 64);
        assert_eq!(decoded.tiling.overlap, 16);
        assert_eq!(decoded.recovery, RecoveryConfig::default());
    }

    #[test]
    fn validate_rejects_bad_tiling() {
        let mut cfg = AppConfig::default();
        cfg.tiling.overlap = cfg.tiling.tile_size;
        assert!(matches!(cfg.validate(), Err(UpscaleError::Config(_))));

        let mut cfg = AppConfig::default();
        cfg.tiling.scale_factor = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.tiling.tile_batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let loaded =
            AppConfig::load_from_path(&temp.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tiling\n").expect("write broken config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_and_logs_paths_live_in_data_dir() {
        assert_eq!(config_path(Path::new("/data")), PathBuf::from("/data/config.toml"));
        assert_eq!(logs_dir(Path::new("/data")), PathBuf::from("/data/logs"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let root = temp.path().join("nested");
        initialize_data_dir(&root).expect("initialize data dir");

        assert!(root.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&root)).expect("reload config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[tiling]\ntile_size = 512\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }
}

#![allow(clippy::result_large_err)]

use super::AppConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from a directory (dir/attacklens.toml).
    /// Environment variables override config file values.
    pub fn load_from_dir(dir: &Path) -> Result<AppConfig, AppError> {
        let config_path = dir.join("attacklens.toml");
        let config_file = Self::load_from_file(&config_path)?;

        let mut config = config_file.unwrap_or_default();
        Self::apply_env_overrides(&mut config);
        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load config from a specific file path; Ok(None) if it doesn't exist.
    pub fn load_from_file(path: &Path) -> Result<Option<AppConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let config: AppConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("CFG-PARSE-001")
        })?;

        Ok(Some(config))
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(bind) = env::var("ATTACKLENS_BIND") {
            config.server.bind = bind;
        }

        if let Ok(db_path) = env::var("ATTACKLENS_DB_PATH") {
            config.storage.db_path = PathBuf::from(db_path);
        }

        if let Ok(upload_dir) = env::var("ATTACKLENS_UPLOAD_DIR") {
            config.storage.upload_dir = PathBuf::from(upload_dir);
        }

        if let Ok(cache_dir) = env::var("ATTACKLENS_CATALOG_CACHE_DIR") {
            config.catalog.cache_dir = PathBuf::from(cache_dir);
        }

        if let Ok(url) = env::var("ATTACKLENS_CATALOG_URL") {
            config.catalog.primary_url = url;
        }

        if let Ok(url) = env::var("ATTACKLENS_CATALOG_BACKUP_URL") {
            config.catalog.backup_url = url;
        }

        if let Ok(hours_str) = env::var("ATTACKLENS_CATALOG_REFRESH_HOURS") {
            if let Ok(hours) = hours_str.parse::<u64>() {
                config.catalog.refresh_interval_hours = hours;
            }
        }

        if let Ok(confidence_str) = env::var("ATTACKLENS_MIN_CONFIDENCE") {
            if let Ok(confidence) = confidence_str.parse::<u8>() {
                config.analysis.min_confidence = confidence;
            }
        }

        if let Ok(level) = env::var("ATTACKLENS_LOG_LEVEL") {
            config.logging.level = level;
        }
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "ATTACKLENS_BIND - Override HTTP listener address",
            "ATTACKLENS_DB_PATH - Override SQLite database path",
            "ATTACKLENS_UPLOAD_DIR - Override upload directory",
            "ATTACKLENS_CATALOG_CACHE_DIR - Override catalog cache directory",
            "ATTACKLENS_CATALOG_URL - Override primary STIX bundle URL",
            "ATTACKLENS_CATALOG_BACKUP_URL - Override backup STIX bundle URL",
            "ATTACKLENS_CATALOG_REFRESH_HOURS - Override catalog refresh interval",
            "ATTACKLENS_MIN_CONFIDENCE - Override minimum match confidence (0-100)",
            "ATTACKLENS_LOG_LEVEL - Override default log filter",
        ]
    }

    /// Validate configuration values
    pub fn validate_config(config: &AppConfig) -> Result<(), AppError> {
        if config.analysis.min_confidence > 100 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "min_confidence must be between 0 and 100".to_string(),
            )
            .with_code("CFG-VAL-001"));
        }

        if config.analysis.chunk_overlap >= config.analysis.chunk_size {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "chunk_overlap must be smaller than chunk_size".to_string(),
            )
            .with_code("CFG-VAL-002"));
        }

        if config.analysis.max_matches == 0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "max_matches must be at least 1".to_string(),
            )
            .with_code("CFG-VAL-003"));
        }

        if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("invalid server bind address {}", config.server.bind),
            )
            .with_code("CFG-VAL-004"));
        }

        Ok(())
    }
}

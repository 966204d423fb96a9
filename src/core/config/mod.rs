mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MAX_DOCUMENT_BYTES: usize = 50 * 1024 * 1024;

/// Main configuration loaded from attacklens.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP listener binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory owning uploaded documents. All upload access is confined here.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Directory for the cached STIX bundle and its meta.json.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Primary bundle source.
    #[serde(default = "default_primary_url")]
    pub primary_url: String,

    /// Fallback bundle source consulted when the primary is unreachable.
    #[serde(default = "default_backup_url")]
    pub backup_url: String,

    /// Cache entries older than this are refreshed.
    #[serde(default = "default_refresh_interval_hours")]
    pub refresh_interval_hours: u64,

    /// Per-request timeout for bundle downloads.
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Hard cap on raw document bytes, both for uploads and URL fetches.
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Paragraph-mode chunking when true, character windows otherwise.
    #[serde(default = "default_true")]
    pub preserve_headers: bool,

    /// Matches below this confidence are dropped from results.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: u8,

    /// Maximum matches kept per document after sorting by score.
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,

    /// Context window size around a matched substring.
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_true")]
    pub enable_keyword: bool,

    #[serde(default = "default_true")]
    pub enable_tfidf: bool,

    #[serde(default = "default_true")]
    pub enable_fuzzy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Per-attempt task timeout.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Additional attempts after the first failure.
    #[serde(default = "default_task_retries")]
    pub task_retries: u32,

    /// Exact wait between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Running workflows untouched for longer than this are failed as crashed
    /// on startup.
    #[serde(default = "default_recovery_grace_minutes")]
    pub recovery_grace_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter; RUST_LOG overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_bind() -> String {
    "127.0.0.1:8688".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("attacklens.db")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".attacklens/catalog")
}

fn default_primary_url() -> String {
    "https://raw.githubusercontent.com/mitre/cti/master/enterprise-attack/enterprise-attack.json"
        .to_string()
}

fn default_backup_url() -> String {
    "https://raw.githubusercontent.com/mitre-attack/attack-stix-data/master/enterprise-attack/enterprise-attack.json"
        .to_string()
}

fn default_refresh_interval_hours() -> u64 {
    24
}

fn default_fetch_timeout_seconds() -> u64 {
    60
}

fn default_max_document_bytes() -> usize {
    MAX_DOCUMENT_BYTES
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_min_confidence() -> u8 {
    65
}

fn default_max_matches() -> usize {
    100
}

fn default_context_window() -> usize {
    200
}

fn default_task_timeout_ms() -> u64 {
    120_000
}

fn default_task_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_recovery_grace_minutes() -> i64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".attacklens/logs")
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: default_db_path(),
            upload_dir: default_upload_dir(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            cache_dir: default_cache_dir(),
            primary_url: default_primary_url(),
            backup_url: default_backup_url(),
            refresh_interval_hours: default_refresh_interval_hours(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_document_bytes: default_max_document_bytes(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            preserve_headers: true,
            min_confidence: default_min_confidence(),
            max_matches: default_max_matches(),
            context_window: default_context_window(),
            enable_keyword: true,
            enable_tfidf: true,
            enable_fuzzy: true,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            task_timeout_ms: default_task_timeout_ms(),
            task_retries: default_task_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            recovery_grace_minutes: default_recovery_grace_minutes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file_enabled: false,
            log_dir: default_log_dir(),
        }
    }
}

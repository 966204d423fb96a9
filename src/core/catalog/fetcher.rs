#![allow(clippy::result_large_err)]

//! Cached acquisition of the STIX bundle with change detection.

use crate::core::catalog::model::TechniqueIndex;
use crate::core::catalog::parser::parse_bundle;
use crate::core::config::CatalogConfig;
use crate::core::error::AppError;
use crate::core::storage::TechniqueStore;
use crate::core::types::ErrorCategory;
use crate::utils::files::{atomic_write, sha256_hex};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

const BUNDLE_FILE: &str = "bundle.json";
const META_FILE: &str = "meta.json";

/// An immutable parsed catalog. Shared read-only across workflows; a workflow
/// pins the snapshot its `get-mitre-data` task observed.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub index: Arc<TechniqueIndex>,
    pub version: String,
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Cache metadata persisted next to the raw bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMeta {
    version: String,
    fetched_at: DateTime<Utc>,
    sha256: String,
}

/// Process-wide catalog access: disk cache, refresh with change detection,
/// backup source, stale fallbacks. Refresh is single-writer; readers keep the
/// last good snapshot while one is in progress.
pub struct CatalogService {
    http: reqwest::Client,
    config: CatalogConfig,
    technique_store: Option<Arc<dyn TechniqueStore>>,
    refresh_lock: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    pinned: RwLock<HashMap<String, Arc<CatalogSnapshot>>>,
}

impl CatalogService {
    pub fn new(
        config: CatalogConfig,
        technique_store: Option<Arc<dyn TechniqueStore>>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.fetch_timeout_seconds))
            .build()
            .map_err(AppError::from)?;
        Ok(CatalogService {
            http,
            config,
            technique_store,
            refresh_lock: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
            pinned: RwLock::new(HashMap::new()),
        })
    }

    /// The current catalog, refreshing if the cached copy is missing or aged
    /// out. Never fails while any fallback (disk cache, persisted techniques)
    /// remains usable.
    pub async fn snapshot(&self) -> Result<Arc<CatalogSnapshot>, AppError> {
        if let Some(current) = self.fresh_current() {
            return Ok(current);
        }
        self.refresh(false).await
    }

    /// A previously served snapshot by version, if still pinned.
    pub fn pinned(&self, version: &str) -> Option<Arc<CatalogSnapshot>> {
        self.pinned.read().expect("pinned lock").get(version).cloned()
    }

    /// Force or age-gated refresh. Serialized per process.
    pub async fn refresh(&self, force: bool) -> Result<Arc<CatalogSnapshot>, AppError> {
        let _guard = self.refresh_lock.lock().await;
        if !force {
            if let Some(current) = self.fresh_current() {
                return Ok(current);
            }
            // A fresh-enough disk cache beats a network round trip.
            if let Some(snapshot) = self.load_cache(false)? {
                self.install(Arc::clone(&snapshot.index), snapshot.version.clone(), false, snapshot.fetched_at);
                return Ok(self.current().expect("installed snapshot"));
            }
        }

        let fetch_result = self.fetch_bundle().await;
        let (bytes, source_url) = match fetch_result {
            Ok(ok) => ok,
            Err(fetch_err) => {
                warn!("catalog fetch failed, falling back to cache: {}", fetch_err);
                if let Some(snapshot) = self.load_cache(true)? {
                    self.install(
                        Arc::clone(&snapshot.index),
                        snapshot.version.clone(),
                        true,
                        snapshot.fetched_at,
                    );
                    return Ok(self.current().expect("installed snapshot"));
                }
                if let Some(snapshot) = self.load_persisted()? {
                    self.install(
                        Arc::clone(&snapshot.index),
                        snapshot.version.clone(),
                        true,
                        snapshot.fetched_at,
                    );
                    return Ok(self.current().expect("installed snapshot"));
                }
                return Err(AppError::new(
                    ErrorCategory::FetchError,
                    format!("no cached catalog and all sources unreachable: {}", fetch_err),
                )
                .with_code("CAT-FETCH-003"));
            }
        };

        let sha256 = sha256_hex(&bytes);
        if let Some(meta) = self.read_meta() {
            if meta.sha256 == sha256 {
                // Unchanged content: bump the clock, skip the re-parse when a
                // parsed copy is already live.
                let fetched_at = Utc::now();
                self.write_meta(&CacheMeta {
                    version: meta.version.clone(),
                    fetched_at,
                    sha256: sha256.clone(),
                })?;
                if let Some(current) = self.current() {
                    if current.version == meta.version {
                        self.install(Arc::clone(&current.index), meta.version, false, fetched_at);
                        return Ok(self.current().expect("installed snapshot"));
                    }
                }
            }
        }

        let bundle: Value = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("catalog source {} returned invalid JSON: {}", source_url, err),
            )
            .with_code("CAT-PARSE-002")
        })?;
        let index = Arc::new(parse_bundle(&bundle)?);
        let version = index.version().to_string();
        let fetched_at = Utc::now();

        atomic_write(&self.bundle_path(), &bytes)?;
        self.write_meta(&CacheMeta {
            version: version.clone(),
            fetched_at,
            sha256,
        })?;
        if let Some(store) = &self.technique_store {
            if let Err(err) = store.upsert_techniques(&version, &index) {
                warn!("failed to persist catalog techniques: {}", err);
            }
        }
        info!(version = %version, source = %source_url, techniques = index.len(), "catalog refreshed");
        self.install(index, version, false, fetched_at);
        Ok(self.current().expect("installed snapshot"))
    }

    /// Parse and install a bundle directly, bypassing network and cache.
    /// Used by the offline CLI path and by fixtures-driven setups.
    pub fn install_bundle(&self, bundle: &Value) -> Result<Arc<CatalogSnapshot>, AppError> {
        let index = Arc::new(parse_bundle(bundle)?);
        let version = index.version().to_string();
        self.install(index, version, false, Utc::now());
        Ok(self.current().expect("installed snapshot"))
    }

    fn fresh_current(&self) -> Option<Arc<CatalogSnapshot>> {
        let current = self.current()?;
        let max_age = Duration::hours(self.config.refresh_interval_hours as i64);
        if !current.stale && Utc::now() - current.fetched_at < max_age {
            Some(current)
        } else {
            None
        }
    }

    fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current.read().expect("current lock").clone()
    }

    fn install(
        &self,
        index: Arc<TechniqueIndex>,
        version: String,
        stale: bool,
        fetched_at: DateTime<Utc>,
    ) {
        let snapshot = Arc::new(CatalogSnapshot {
            index,
            version: version.clone(),
            stale,
            fetched_at,
        });
        *self.current.write().expect("current lock") = Some(Arc::clone(&snapshot));
        self.pinned
            .write()
            .expect("pinned lock")
            .insert(version, snapshot);
    }

    async fn fetch_bundle(&self) -> Result<(Vec<u8>, String), AppError> {
        let mut last_error: Option<AppError> = None;
        for url in [&self.config.primary_url, &self.config.backup_url] {
            if url.is_empty() {
                continue;
            }
            match self.fetch_one(url).await {
                Ok(bytes) => return Ok((bytes, url.clone())),
                Err(err) => {
                    warn!(url = %url, "catalog source failed: {}", err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::new(ErrorCategory::FetchError, "no catalog source configured")
                .with_code("CAT-FETCH-001")
        }))
    }

    async fn fetch_one(&self, url: &str) -> Result<Vec<u8>, AppError> {
        let response = self.http.get(url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// The cached bundle, parsed. `any_age` bypasses the freshness check for
    /// stale fallback use.
    fn load_cache(&self, any_age: bool) -> Result<Option<Arc<CatalogSnapshot>>, AppError> {
        let Some(meta) = self.read_meta() else {
            return Ok(None);
        };
        let max_age = Duration::hours(self.config.refresh_interval_hours as i64);
        if !any_age && Utc::now() - meta.fetched_at >= max_age {
            return Ok(None);
        }
        let bytes = match fs::read(self.bundle_path()) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let bundle: Value = match serde_json::from_slice(&bytes) {
            Ok(bundle) => bundle,
            Err(err) => {
                warn!("cached catalog bundle is unreadable: {}", err);
                return Ok(None);
            }
        };
        let index = Arc::new(parse_bundle(&bundle)?);
        Ok(Some(Arc::new(CatalogSnapshot {
            version: index.version().to_string(),
            index,
            stale: any_age,
            fetched_at: meta.fetched_at,
        })))
    }

    /// Last-resort fallback: rebuild the index from techniques persisted by a
    /// previous refresh.
    fn load_persisted(&self) -> Result<Option<Arc<CatalogSnapshot>>, AppError> {
        let Some(store) = &self.technique_store else {
            return Ok(None);
        };
        let Some((version, techniques)) = store.load_techniques()? else {
            return Ok(None);
        };
        if techniques.is_empty() {
            return Ok(None);
        }
        info!(version = %version, "serving catalog from persisted techniques");
        let index = Arc::new(TechniqueIndex::from_techniques(version.clone(), techniques));
        Ok(Some(Arc::new(CatalogSnapshot {
            index,
            version,
            stale: true,
            fetched_at: Utc::now(),
        })))
    }

    fn bundle_path(&self) -> PathBuf {
        self.config.cache_dir.join(BUNDLE_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.config.cache_dir.join(META_FILE)
    }

    fn read_meta(&self) -> Option<CacheMeta> {
        let bytes = fs::read(self.meta_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_meta(&self, meta: &CacheMeta) -> Result<(), AppError> {
        let content = serde_json::to_vec_pretty(meta)?;
        atomic_write(&self.meta_path(), &content)
    }
}

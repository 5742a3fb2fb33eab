//! Versioned response cache
//!
//! Responses live in named generations. Only the generation named by the
//! current cache version is ever read or written; older generations are
//! deleted when a new version activates.

use crate::disk_format::{atomic_write, decode_frame, encode_frame, hashed_name};
use crate::error::{ProxyError, Result};
use crate::key_normalizer::{CacheKey, KeyNormalizer};
use crate::models::CachedResponse;
use crate::network::{strip_hop_by_hop, OriginClient};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ENTRY_MAGIC: &[u8; 4] = b"TPC1";

/// Storage holding any number of named cache generations
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the named generation if it does not exist
    async fn open(&self, cache: &str) -> Result<()>;

    async fn has(&self, cache: &str) -> Result<bool>;

    /// Names of every generation present
    async fn cache_names(&self) -> Result<Vec<String>>;

    /// Delete a generation; `false` when it did not exist
    async fn delete_cache(&self, cache: &str) -> Result<bool>;

    async fn put(&self, cache: &str, key: &str, entry: CachedResponse) -> Result<()>;

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>>;
}

/// In-memory cache storage
#[derive(Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, HashMap<String, CachedResponse>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, cache: &str) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(cache))
    }

    async fn cache_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn put(&self, cache: &str, key: &str, entry: CachedResponse) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default()
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(key))
            .cloned())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    response: CachedResponse,
}

/// File-backed cache storage: one directory per generation, one file per entry
pub struct DiskCacheStorage {
    base: PathBuf,
}

impl DiskCacheStorage {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                base.display(),
                e
            ))
        })?;
        Ok(DiskCacheStorage { base })
    }

    fn cache_dir(&self, cache: &str) -> Result<PathBuf> {
        let valid = !cache.is_empty()
            && !cache.starts_with('.')
            && cache
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(ProxyError::CacheError(format!(
                "Invalid cache name: {:?}",
                cache
            )));
        }
        Ok(self.base.join(cache))
    }

    fn entry_path(&self, cache: &str, key: &str) -> Result<PathBuf> {
        Ok(self
            .cache_dir(cache)?
            .join(format!("{}.entry", hashed_name(key))))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, cache: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.cache_dir(cache)?).await?;
        Ok(())
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.cache_dir(cache)?).await?)
    }

    async fn cache_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.cache_dir(cache)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, cache: &str, key: &str, entry: CachedResponse) -> Result<()> {
        let path = self.entry_path(cache, key)?;
        let stored = StoredEntry {
            key: key.to_string(),
            response: entry,
        };
        let payload = bincode::serialize(&stored)
            .map_err(|e| ProxyError::CacheError(format!("Failed to encode entry: {}", e)))?;
        atomic_write(&path, &encode_frame(ENTRY_MAGIC, &payload)).await
    }

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>> {
        let path = self.entry_path(cache, key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(payload) = decode_frame(ENTRY_MAGIC, &data) else {
            warn!("Corrupt cache entry at {}, treating as miss", path.display());
            return Ok(None);
        };

        match bincode::deserialize::<StoredEntry>(payload) {
            Ok(stored) if stored.key == key => Ok(Some(stored.response)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Undecodable cache entry at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

/// Where the current generation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Installing,
    Installed,
    Activating,
    Active,
}

/// Outcome of precaching the asset list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub version: String,
    pub cached: Vec<String>,
    pub failed: Vec<String>,
    /// Present when a pending skip-waiting activated the generation
    pub activation: Option<ActivationReport>,
}

/// Outcome of activating the current generation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub current: String,
    pub deleted: Vec<String>,
}

#[derive(Debug)]
struct Lifecycle {
    state: LifecycleState,
    skip_waiting: bool,
}

/// Lifecycle and read/write access for the current cache generation
pub struct VersionedCacheStore {
    storage: Arc<dyn CacheStorage>,
    current: String,
    lifecycle: Mutex<Lifecycle>,
    navigation_preload: AtomicBool,
    clients_claimed: AtomicBool,
}

impl VersionedCacheStore {
    pub fn new(storage: Arc<dyn CacheStorage>, current: impl Into<String>) -> Self {
        VersionedCacheStore {
            storage,
            current: current.into(),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Pending,
                skip_waiting: false,
            }),
            navigation_preload: AtomicBool::new(false),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.navigation_preload.load(Ordering::Acquire)
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: LifecycleState) {
        self.lock().state = state;
    }

    /// Fetch and store every listed asset into the current generation
    ///
    /// Individual failures are recorded in the report and never abort the
    /// install. Only 200 responses are stored.
    pub async fn install(
        &self,
        assets: &[String],
        normalizer: &KeyNormalizer,
        client: &OriginClient,
        max_concurrent: usize,
    ) -> Result<InstallReport> {
        self.set_state(LifecycleState::Installing);
        info!(
            "Installing cache generation {} ({} assets)",
            self.current,
            assets.len()
        );

        if let Err(e) = self.storage.open(&self.current).await {
            self.set_state(LifecycleState::Pending);
            return Err(e);
        }

        let outcomes: Vec<(String, bool)> = stream::iter(assets.iter().cloned())
            .map(|asset| async move {
                let ok = self.precache_one(&asset, normalizer, client).await;
                (asset, ok)
            })
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await;

        let mut report = InstallReport {
            version: self.current.clone(),
            ..Default::default()
        };
        for (asset, ok) in outcomes {
            if ok {
                report.cached.push(asset);
            } else {
                report.failed.push(asset);
            }
        }
        report.cached.sort();
        report.failed.sort();

        let activate_now = {
            let mut lifecycle = self.lock();
            lifecycle.state = LifecycleState::Installed;
            lifecycle.skip_waiting
        };
        info!(
            "Installed cache generation {}: {} cached, {} failed",
            self.current,
            report.cached.len(),
            report.failed.len()
        );

        if activate_now {
            report.activation = Some(self.activate().await?);
        }
        Ok(report)
    }

    async fn precache_one(
        &self,
        asset: &str,
        normalizer: &KeyNormalizer,
        client: &OriginClient,
    ) -> bool {
        let Some(key) = normalizer.normalize_path(asset) else {
            warn!("Precache entry {} is not a same-origin path, skipping", asset);
            return false;
        };

        let response = match client.fetch_get(key.url(), &HeaderMap::new()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to precache {}: {}", asset, e);
                return false;
            }
        };

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to read precache body for {}: {}", asset, e);
                return false;
            }
        };

        let entry = CachedResponse::new(status, &headers, body);
        if !entry.is_cacheable() {
            warn!("Precache of {} returned {}, not stored", asset, status);
            return false;
        }

        match self.put(&key, entry).await {
            Ok(()) => {
                debug!("Precached {}", key);
                true
            }
            Err(e) => {
                warn!("Failed to store precached {}: {}", asset, e);
                false
            }
        }
    }

    /// Request activation without waiting for existing clients
    ///
    /// Activates immediately once installed; if install is still running the
    /// request is remembered and honored when it completes.
    pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>> {
        let installed = {
            let mut lifecycle = self.lock();
            lifecycle.skip_waiting = true;
            lifecycle.state == LifecycleState::Installed
        };
        if installed {
            Ok(Some(self.activate().await?))
        } else {
            debug!("Skip-waiting recorded in state {:?}", self.state());
            Ok(None)
        }
    }

    /// Delete every generation other than the current one and take control
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.set_state(LifecycleState::Activating);

        let names = self.storage.cache_names().await?;
        let mut deleted = Vec::new();
        for name in names.into_iter().filter(|name| *name != self.current) {
            match self.storage.delete_cache(&name).await {
                Ok(true) => {
                    info!("Deleted stale cache generation {}", name);
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to delete cache generation {}: {}", name, e),
            }
        }

        self.storage.open(&self.current).await?;
        self.navigation_preload.store(true, Ordering::Release);
        self.clients_claimed.store(true, Ordering::Release);
        self.set_state(LifecycleState::Active);
        info!("Cache generation {} active", self.current);

        Ok(ActivationReport {
            current: self.current.clone(),
            deleted,
        })
    }

    /// Store a response in the current generation
    pub async fn put(&self, key: &CacheKey, entry: CachedResponse) -> Result<()> {
        self.storage.put(&self.current, key.as_str(), entry).await
    }

    /// Look up a response in the current generation only
    pub async fn match_key(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
        self.storage.get(&self.current, key.as_str()).await
    }
}

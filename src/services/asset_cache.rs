use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::errors::{AssetError, Result};
use crate::models::{
    AssetKey, CacheEvent, CacheResult, CancelToken, LinkMode, MaterializeOutcome,
};
use crate::services::api_client::DownloadOpen;
use crate::services::cache_manager::{AtomicFile, CacheManager};

/// Registry of per-asset-key locks. The meta-lock guards only lookup and
/// insertion; the per-key mutex is what a download holds, so unrelated keys
/// never wait on each other.
#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| AssetError::Config("lock registry poisoned".to_string()))?;
        Ok(guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub downloads: u64,
    pub missing_optional: u64,
}

/// Collapses concurrent requests for the same `AssetKey` into exactly one
/// download and serves every requester from the same cached file.
#[derive(Clone)]
pub struct AssetCache {
    cache: CacheManager,
    locks: LockRegistry,
    stats: Arc<Mutex<CacheStats>>,
}

impl AssetCache {
    pub fn new(cache: CacheManager, locks: LockRegistry) -> Self {
        Self {
            cache,
            locks,
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    pub fn cache_manager(&self) -> &CacheManager {
        &self.cache
    }

    /// Canonical on-disk location for this asset.
    pub fn cache_path(&self, key: &AssetKey) -> Result<PathBuf> {
        self.cache.resolve_path(&key.cache_rel_path())
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    fn bump_stat<F>(&self, mut update: F)
    where
        F: FnMut(&mut CacheStats),
    {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Fetch the asset into the cache unless it is already there.
    ///
    /// Fast path: an existing cache file is returned without touching the
    /// lock registry. Otherwise the per-key lock is taken and existence is
    /// re-checked, so a requester that lost the race still sees a hit
    /// instead of re-downloading.
    pub async fn get_or_download<F, Fut, P>(
        &self,
        key: &AssetKey,
        open_stream: F,
        allow_not_found: bool,
        cancel: &CancelToken,
        mut on_bytes: P,
    ) -> Result<CacheResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DownloadOpen>>,
        P: FnMut(u64, Option<u64>),
    {
        cancel.check()?;
        let path = self.cache_path(key)?;
        if path.exists() {
            self.bump_stat(|stats| stats.hits += 1);
            tracing::debug!("asset cache hit key={}", key);
            return Ok(CacheResult {
                path: Some(path),
                event: CacheEvent::CacheHit,
            });
        }

        let lock = self.locks.lock_for(&key.registry_key())?;
        let _guard = lock.lock().await;

        if path.exists() {
            self.bump_stat(|stats| stats.hits += 1);
            tracing::debug!("asset cache hit after wait key={}", key);
            return Ok(CacheResult {
                path: Some(path),
                event: CacheEvent::CacheHit,
            });
        }

        cancel.check()?;
        self.bump_stat(|stats| stats.misses += 1);

        match open_stream().await? {
            DownloadOpen::NotFound => {
                if allow_not_found {
                    self.bump_stat(|stats| stats.missing_optional += 1);
                    tracing::debug!("optional asset missing key={}", key);
                    return Ok(CacheResult {
                        path: None,
                        event: CacheEvent::MissingOptional,
                    });
                }
                Err(AssetError::NotFound(key.to_string()))
            }
            DownloadOpen::Stream(mut stream) => {
                let total = stream.total_bytes();
                let mut file = AtomicFile::begin(&path)?;
                let mut done = 0u64;
                while let Some(chunk) = stream.next_chunk().await? {
                    cancel.check()?;
                    file.write_chunk(&chunk)?;
                    done += chunk.len() as u64;
                    on_bytes(done, total);
                }
                file.commit()?;
                self.bump_stat(|stats| stats.downloads += 1);
                tracing::debug!("asset downloaded key={} bytes={}", key, done);
                Ok(CacheResult {
                    path: Some(path),
                    event: CacheEvent::Downloaded,
                })
            }
        }
    }

    /// Place the cached bytes at `dest` via hardlink or copy. An existing
    /// destination with `overwrite` unset is a reported no-op.
    pub fn materialize_to(
        &self,
        cache_path: &Path,
        dest: &Path,
        mode: LinkMode,
        overwrite: bool,
    ) -> Result<MaterializeOutcome> {
        if dest.exists() {
            if !overwrite {
                return Ok(MaterializeOutcome::Skipped);
            }
            fs::remove_file(dest)?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match mode {
            LinkMode::Copy => {
                fs::copy(cache_path, dest)?;
                Ok(MaterializeOutcome::Copied)
            }
            LinkMode::Hardlink => {
                fs::hard_link(cache_path, dest)?;
                Ok(MaterializeOutcome::Linked)
            }
            LinkMode::Auto => match fs::hard_link(cache_path, dest) {
                Ok(()) => Ok(MaterializeOutcome::Linked),
                Err(err) => {
                    tracing::debug!(
                        "hardlink failed for {}, falling back to copy: {}",
                        dest.display(),
                        err
                    );
                    fs::copy(cache_path, dest)?;
                    Ok(MaterializeOutcome::Copied)
                }
            },
        }
    }
}

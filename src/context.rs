use once_cell::sync::OnceCell;

use crate::config::Settings;
use crate::errors::Result;
use crate::services::asset_cache::LockRegistry;
use crate::services::{ApiClient, AssetCache, CacheManager, CostumeService, Downloader};

/// Explicit dependency container. Each service is constructed on first
/// access and memoized; wiring always happens in the order CacheManager →
/// ApiClient → AssetCache → CostumeService → Downloader.
pub struct AppContext {
    settings: Settings,
    cache_manager: OnceCell<CacheManager>,
    api_client: OnceCell<ApiClient>,
    asset_cache: OnceCell<Option<AssetCache>>,
    costume_service: OnceCell<CostumeService>,
    downloader: OnceCell<Downloader>,
}

impl AppContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            cache_manager: OnceCell::new(),
            api_client: OnceCell::new(),
            asset_cache: OnceCell::new(),
            costume_service: OnceCell::new(),
            downloader: OnceCell::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Settings::from_env())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache_manager(&self) -> Result<&CacheManager> {
        self.cache_manager
            .get_or_try_init(|| CacheManager::new(self.settings.cache_root.clone()))
    }

    pub fn api_client(&self) -> Result<&ApiClient> {
        self.api_client.get_or_try_init(|| {
            let cache = if self.settings.cache_enabled {
                Some(self.cache_manager()?.clone())
            } else {
                None
            };
            Ok(ApiClient::new(&self.settings, cache))
        })
    }

    /// `None` when caching is disabled; the downloader then streams files
    /// directly into their destinations.
    pub fn asset_cache(&self) -> Result<Option<&AssetCache>> {
        let slot = self
            .asset_cache
            .get_or_try_init(|| -> Result<Option<AssetCache>> {
                if !self.settings.cache_enabled {
                    return Ok(None);
                }
                Ok(Some(AssetCache::new(
                    self.cache_manager()?.clone(),
                    LockRegistry::new(),
                )))
            })?;
        Ok(slot.as_ref())
    }

    pub fn costume_service(&self) -> Result<&CostumeService> {
        self.costume_service.get_or_try_init(|| {
            Ok(CostumeService::new(
                self.api_client()?.clone(),
                &self.settings,
            ))
        })
    }

    pub fn downloader(&self) -> Result<&Downloader> {
        self.downloader.get_or_try_init(|| {
            Ok(Downloader::new(
                self.api_client()?.clone(),
                self.asset_cache()?.cloned(),
                self.costume_service()?.clone(),
                &self.settings,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings(cache_enabled: bool) -> Settings {
        Settings {
            cache_root: std::env::temp_dir()
                .join(format!("l2d-context-test-{}", uuid::Uuid::new_v4())),
            cache_enabled,
            ..Settings::default()
        }
    }

    #[test]
    fn accessors_memoize_their_services() {
        let context = AppContext::new(temp_settings(true));
        let first = context.downloader().expect("downloader") as *const _;
        let second = context.downloader().expect("downloader") as *const _;
        assert_eq!(first, second);
        assert!(context.asset_cache().expect("asset cache").is_some());
    }

    #[test]
    fn disabled_cache_yields_no_asset_cache() {
        let context = AppContext::new(temp_settings(false));
        assert!(context.asset_cache().expect("asset cache").is_none());
        context.downloader().expect("downloader still wires up");
    }
}

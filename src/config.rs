use std::path::PathBuf;
use std::time::Duration;

use crate::models::{Language, LinkMode, Server};

const DEFAULT_API_BASE: &str = "https://api.live2d-models.net";
const DEFAULT_ASSET_BASE: &str = "https://assets.live2d-models.net";
const DEFAULT_JSON_TTL_SECS: u64 = 6 * 60 * 60;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MATCH_THRESHOLD: u8 = 75;

#[derive(Clone, Debug)]
pub struct Settings {
    pub api_base: String,
    pub asset_base: String,
    pub server: Server,
    pub language: Language,
    pub cache_root: PathBuf,
    pub cache_enabled: bool,
    pub json_ttl_secs: u64,
    pub max_workers: usize,
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub link_mode: LinkMode,
    pub match_threshold: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            asset_base: DEFAULT_ASSET_BASE.to_string(),
            server: Server::Japanese,
            language: Language::English,
            cache_root: PathBuf::from("cache"),
            cache_enabled: true,
            json_ttl_secs: DEFAULT_JSON_TTL_SECS,
            max_workers: DEFAULT_MAX_WORKERS,
            retries: DEFAULT_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            link_mode: LinkMode::Auto,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Settings {
    /// Defaults with `L2D_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Some(value) = env_string("L2D_API_BASE") {
            settings.api_base = value;
        }
        if let Some(value) = env_string("L2D_ASSET_BASE") {
            settings.asset_base = value;
        }
        if let Some(value) = env_string("L2D_SERVER").and_then(|v| Server::parse(&v)) {
            settings.server = value;
        }
        if let Some(value) = env_string("L2D_LANGUAGE").and_then(|v| Language::parse(&v)) {
            settings.language = value;
        }
        if let Some(value) = env_string("L2D_CACHE_DIR") {
            settings.cache_root = PathBuf::from(value);
        }
        if let Some(value) = env_string("L2D_CACHE_ENABLED") {
            settings.cache_enabled = truthy(&value);
        }
        if let Some(value) = env_u64("L2D_JSON_TTL_SECS") {
            settings.json_ttl_secs = value;
        }
        if let Some(value) = env_u64("L2D_MAX_WORKERS") {
            settings.max_workers = (value as usize).clamp(1, 32);
        }
        if let Some(value) = env_u64("L2D_RETRIES") {
            settings.retries = (value as u32).min(10);
        }
        if let Some(value) = env_u64("L2D_BACKOFF_MS") {
            settings.backoff_base_ms = value.clamp(0, 30_000);
        }
        if let Some(value) = env_string("L2D_LINK_MODE").and_then(|v| LinkMode::parse(&v)) {
            settings.link_mode = value;
        }
        if let Some(value) = env_u64("L2D_MATCH_THRESHOLD") {
            settings.match_threshold = (value as u8).min(100);
        }
        settings
    }

    pub fn json_ttl(&self) -> Duration {
        Duration::from_secs(self.json_ttl_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|value| value.parse::<u64>().ok())
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

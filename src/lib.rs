//! Content-addressed download and cache layer for Live2D character models.
//!
//! Fetches model bundles (geometry, textures, motions, physics) from the
//! remote content-delivery API, deduplicates concurrent requests for the
//! same asset through a global on-disk cache, and materializes cached bytes
//! into per-model output directories via hardlink or copy.

pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;

pub use config::Settings;
pub use context::AppContext;
pub use errors::{AssetError, Result};
pub use models::{
    AssetKey, CacheEvent, CacheResult, CancelToken, Costume, FileKind, FileOutcome, FileProgress,
    FileSpec, Language, LinkMode, MaterializeOutcome, ModelProgress, ProgressUpdate, Server,
};
pub use services::{
    ApiClient, AssetCache, CacheManager, CacheStats, CostumeService, DownloadOpen, DownloadStream,
    Downloader, LockRegistry, ProgressSink, MANIFEST_FILE,
};

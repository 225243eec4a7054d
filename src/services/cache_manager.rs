use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::errors::{AssetError, Result};
use crate::models;

#[derive(Serialize, Deserialize)]
struct Envelope {
    data: serde_json::Value,
    #[serde(default)]
    created_at: Option<i64>,
}

/// Keyed storage under one cache root. Reads treat malformed or expired
/// content as a miss; only path-security and write failures surface as
/// errors.
#[derive(Clone, Debug)]
pub struct CacheManager {
    root: PathBuf,
}

impl CacheManager {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The single security gate: every on-disk location below the cache
    /// root is resolved through here.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf> {
        let rel = models::sanitize_relative(relative)?;
        Ok(self.root.join(rel))
    }

    fn json_path(&self, key: &str) -> Result<PathBuf> {
        self.resolve_path(&format!("{key}.json"))
    }

    pub fn read_text(&self, key: &str) -> Result<Option<String>> {
        let path = self.resolve_path(key)?;
        Ok(fs::read_to_string(path).ok())
    }

    pub fn write_text(&self, key: &str, value: &str) -> Result<()> {
        self.write_bytes(key, value.as_bytes())
    }

    pub fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        Ok(fs::read(path).ok())
    }

    pub fn write_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.resolve_path(key)?;
        self.atomic_write_bytes(&path, |file| file.write_chunk(value))
    }

    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(text) = self.read_text(&format!("{key}.json"))? else {
            return Ok(None);
        };
        Ok(serde_json::from_str::<T>(&text).ok())
    }

    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.json_path(key)?;
        let text = serde_json::to_string(value)?;
        self.atomic_write_bytes(&path, |file| file.write_chunk(text.as_bytes()))
    }

    /// Read a TTL-wrapped JSON document. Absent `created_at`, unparsable
    /// content or an exceeded TTL all count as a miss.
    pub fn read_expiring_json<T: DeserializeOwned>(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<T>> {
        let Some(text) = self.read_text(&format!("{key}.json"))? else {
            return Ok(None);
        };
        let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
            return Ok(None);
        };
        let Some(created_at) = envelope.created_at else {
            return Ok(None);
        };
        let age = chrono::Utc::now().timestamp() - created_at;
        if age > ttl.as_secs() as i64 {
            return Ok(None);
        }
        Ok(serde_json::from_value::<T>(envelope.data).ok())
    }

    pub fn write_expiring_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let envelope = Envelope {
            data: serde_json::to_value(value)?,
            created_at: Some(chrono::Utc::now().timestamp()),
        };
        self.write_json(key, &envelope)
    }

    /// One-shot atomic write: the writer fills a scoped temp file which is
    /// fsynced and renamed over `dest` only after it returns successfully.
    pub fn atomic_write_bytes<F>(&self, dest: &Path, writer: F) -> Result<()>
    where
        F: FnOnce(&mut AtomicFile) -> Result<()>,
    {
        let mut file = AtomicFile::begin(dest)?;
        writer(&mut file)?;
        file.commit()
    }
}

/// Scoped same-directory temp file. Dropping it without `commit` removes
/// the temp file and its descriptor, so every exit path — partial write,
/// mid-flush failure, cancellation — leaves no debris behind.
pub struct AtomicFile {
    tmp: NamedTempFile,
    dest: PathBuf,
}

impl AtomicFile {
    pub fn begin(dest: &Path) -> Result<Self> {
        let parent = dest.parent().ok_or_else(|| {
            AssetError::Config(format!("destination has no parent: {}", dest.display()))
        })?;
        fs::create_dir_all(parent)?;
        let tmp = NamedTempFile::new_in(parent)?;
        Ok(Self {
            tmp,
            dest: dest.to_path_buf(),
        })
    }

    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.tmp.as_file_mut().write_all(bytes)?;
        Ok(())
    }

    /// Flush + fsync, then rename-replace onto the destination.
    pub fn commit(mut self) -> Result<()> {
        self.tmp.as_file_mut().flush()?;
        self.tmp.as_file().sync_all()?;
        self.tmp
            .persist(&self.dest)
            .map_err(|err| AssetError::Io(err.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> CacheManager {
        let dir = std::env::temp_dir().join(format!("l2d-cache-test-{}", uuid::Uuid::new_v4()));
        CacheManager::new(dir).expect("create cache manager")
    }

    #[test]
    fn resolve_path_rejects_escapes() {
        let cache = temp_cache();
        for bad in ["../up", "/abs", "a\\b", ""] {
            let err = cache.resolve_path(bad).expect_err(bad);
            assert!(matches!(err, AssetError::PathSecurity(_)));
        }
    }

    #[test]
    fn malformed_json_reads_as_miss() {
        let cache = temp_cache();
        cache.write_text("bad.json", "{not json").expect("write");
        let value: Option<serde_json::Value> = cache.read_json("bad").expect("read");
        assert!(value.is_none());
    }

    #[test]
    fn expiring_json_round_trips_within_ttl() {
        let cache = temp_cache();
        cache
            .write_expiring_json("roster", &serde_json::json!({"id": 36}))
            .expect("write");
        let value: Option<serde_json::Value> = cache
            .read_expiring_json("roster", Duration::from_secs(60))
            .expect("read");
        assert_eq!(value.expect("hit")["id"], 36);
    }

    #[test]
    fn expired_envelope_is_a_miss() {
        let cache = temp_cache();
        let stale = serde_json::json!({
            "data": {"id": 36},
            "created_at": chrono::Utc::now().timestamp() - 3600,
        });
        cache.write_json("stale", &stale).expect("write");
        let value: Option<serde_json::Value> = cache
            .read_expiring_json("stale", Duration::from_secs(10))
            .expect("read");
        assert!(value.is_none());
    }

    #[test]
    fn envelope_without_created_at_is_a_miss() {
        let cache = temp_cache();
        cache
            .write_json("bare", &serde_json::json!({"data": {"id": 1}}))
            .expect("write");
        let value: Option<serde_json::Value> = cache
            .read_expiring_json("bare", Duration::from_secs(60))
            .expect("read");
        assert!(value.is_none());
    }

    #[test]
    fn atomic_write_leaves_no_temp_on_writer_error() {
        let cache = temp_cache();
        let dest = cache.root().join("blob.bin");
        let result = cache.atomic_write_bytes(&dest, |file| {
            file.write_chunk(b"partial")?;
            Err(AssetError::Config("writer failed".to_string()))
        });
        assert!(result.is_err());
        assert!(!dest.exists());
        let leftovers: Vec<_> = fs::read_dir(cache.root())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .collect();
        assert!(leftovers.is_empty(), "temp file leaked: {leftovers:?}");
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let cache = temp_cache();
        let dest = cache.root().join("blob.bin");
        cache
            .atomic_write_bytes(&dest, |file| file.write_chunk(b"first"))
            .expect("first write");
        cache
            .atomic_write_bytes(&dest, |file| file.write_chunk(b"second"))
            .expect("second write");
        assert_eq!(fs::read(&dest).expect("read"), b"second");
    }
}

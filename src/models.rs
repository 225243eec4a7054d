use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{AssetError, Result};

/// Regional API endpoint selector. The slug is the path segment used by the
/// content-delivery server.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    Japanese,
    English,
    Chinese,
    Korean,
}

impl Server {
    pub fn slug(&self) -> &'static str {
        match self {
            Server::Japanese => "jp",
            Server::English => "en",
            Server::Chinese => "cn",
            Server::Korean => "kr",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jp" | "japanese" => Some(Server::Japanese),
            "en" | "english" => Some(Server::English),
            "cn" | "chinese" => Some(Server::Chinese),
            "kr" | "korean" => Some(Server::Korean),
            _ => None,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Localized-name selector. The ordinal indexes the remote multi-language
/// name array `[cn, en, jp, kr]`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Chinese,
    English,
    Japanese,
    Korean,
}

impl Language {
    pub fn name_index(&self) -> usize {
        match self {
            Language::Chinese => 0,
            Language::English => 1,
            Language::Japanese => 2,
            Language::Korean => 3,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cn" | "chinese" => Some(Language::Chinese),
            "en" | "english" => Some(Language::English),
            "jp" | "japanese" => Some(Language::Japanese),
            "kr" | "korean" => Some(Language::Korean),
            _ => None,
        }
    }
}

/// Identity of one deduplicatable remote asset. Identical keys always map to
/// identical bytes; the remote never rewrites a published file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetKey {
    pub bundle: String,
    pub file: String,
    pub server: Server,
}

impl AssetKey {
    pub fn new(bundle: impl Into<String>, file: impl Into<String>, server: Server) -> Self {
        Self {
            bundle: bundle.into(),
            file: file.into(),
            server,
        }
    }

    /// Canonical location of this asset below the cache root.
    pub fn cache_rel_path(&self) -> String {
        format!(
            "live2d/assets/{}/{}/{}",
            self.server.slug(),
            self.bundle,
            self.file
        )
    }

    /// Stable string identity used by the per-key lock registry.
    pub fn registry_key(&self) -> String {
        format!("{}/{}/{}", self.server.slug(), self.bundle, self.file)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.registry_key())
    }
}

/// Role of one file inside a costume. Motions carry their manifest category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Model,
    Physics,
    Texture,
    Motion(String),
    Expression,
}

impl FileKind {
    pub fn label(&self) -> &str {
        match self {
            FileKind::Model => "model",
            FileKind::Physics => "physics",
            FileKind::Texture => "texture",
            FileKind::Motion(_) => "motion",
            FileKind::Expression => "expression",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileSpec {
    pub source: AssetKey,
    /// Output path relative to the model directory.
    pub dest: String,
    pub optional: bool,
    pub kind: FileKind,
}

#[derive(Clone, Debug)]
pub struct Costume {
    pub name: String,
    pub files: Vec<FileSpec>,
}

/// Shared cooperative-cancellation flag. Cloned into every worker spawned
/// for one download session; checked at safe points only.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(AssetError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct FileProgress {
    pub file: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelProgress {
    pub files_done: usize,
    pub files_total: usize,
}

/// Either `file` or `model` is always present; consumers must not assume
/// exactly one of them is.
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    pub file: Option<FileProgress>,
    pub model: Option<ModelProgress>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    CacheHit,
    Downloaded,
    MissingOptional,
}

/// Outcome of one cache lookup/fill.
#[derive(Clone, Debug)]
pub struct CacheResult {
    pub path: Option<PathBuf>,
    pub event: CacheEvent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    /// Attempt a hardlink, fall back to a byte copy on any OS-level failure.
    Auto,
    /// Fail hard when linking is unsupported (e.g. cross-volume).
    Hardlink,
    Copy,
}

impl LinkMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(LinkMode::Auto),
            "hardlink" => Some(LinkMode::Hardlink),
            "copy" => Some(LinkMode::Copy),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Linked,
    Copied,
    Skipped,
}

/// Terminal per-file state surfaced by the downloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    DirectDownload,
    Linked,
    Copied,
    Skipped,
    MissingOptional,
}

/// Validate a caller-supplied relative path. Absolute paths, backslashes,
/// empty input and any non-plain segment (`..`, `.`, prefixes) are rejected
/// outright; nothing is ever silently corrected.
pub fn sanitize_relative(rel: &str) -> Result<PathBuf> {
    if rel.trim().is_empty() {
        return Err(AssetError::PathSecurity("empty relative path".to_string()));
    }
    if rel.contains('\\') {
        return Err(AssetError::PathSecurity(format!(
            "backslash in path: {rel}"
        )));
    }
    let path = Path::new(rel);
    if path.is_absolute() {
        return Err(AssetError::PathSecurity(format!("absolute path: {rel}")));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(AssetError::PathSecurity(format!(
                    "illegal segment in path: {rel}"
                )));
            }
        }
    }
    Ok(path.to_path_buf())
}

/// Resolve `rel` below `root`, refusing symlinked intermediate directories
/// and symlinked destination files. Runs before any filesystem mutation.
pub fn secure_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = sanitize_relative(rel)?;
    let mut current = root.to_path_buf();
    for component in rel.components() {
        current.push(component);
        if let Ok(meta) = std::fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() {
                return Err(AssetError::PathSecurity(format!(
                    "symlink in destination path: {}",
                    current.display()
                )));
            }
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("l2d-models-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn asset_key_cache_path_includes_server_segment() {
        let key = AssetKey::new("036_general", "angry01.mtn", Server::Japanese);
        assert_eq!(
            key.cache_rel_path(),
            "live2d/assets/jp/036_general/angry01.mtn"
        );
    }

    #[test]
    fn sanitize_rejects_traversal_and_absolute_paths() {
        for bad in [
            "",
            "   ",
            "../evil",
            "a/../b",
            "a/..",
            "/etc/passwd",
            "a\\b",
            "./a",
        ] {
            let err = sanitize_relative(bad).expect_err(bad);
            assert!(
                matches!(err, AssetError::PathSecurity(_)),
                "expected PathSecurity for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn sanitize_accepts_plain_nested_paths() {
        assert!(sanitize_relative("motions/angry01.mtn").is_ok());
        assert!(sanitize_relative("model.moc").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn secure_join_rejects_symlinked_ancestor() {
        let root = temp_dir();
        let outside = temp_dir();
        std::os::unix::fs::symlink(&outside, root.join("textures")).expect("symlink");

        let err = secure_join(&root, "textures/texture_00.png").expect_err("symlink ancestor");
        assert!(matches!(err, AssetError::PathSecurity(_)));
    }

    #[cfg(unix)]
    #[test]
    fn secure_join_rejects_symlinked_destination() {
        let root = temp_dir();
        std::fs::write(root.join("real.moc"), b"x").expect("write");
        std::os::unix::fs::symlink(root.join("real.moc"), root.join("model.moc"))
            .expect("symlink");

        let err = secure_join(&root, "model.moc").expect_err("symlink destination");
        assert!(matches!(err, AssetError::PathSecurity(_)));
    }

    #[test]
    fn cancel_token_trips_once_set() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(AssetError::Cancelled)));
        assert!(token.clone().is_cancelled());
    }
}

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Metadata parse error: {0}")]
    Parse(String),
    #[error("Unsafe path rejected: {0}")]
    PathSecurity(String),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Missing required files: {0:?}")]
    MissingFiles(Vec<String>),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No match for query: {0}")]
    NoMatch(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl AssetError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            AssetError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AssetError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;

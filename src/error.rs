//! Error taxonomy for the store.
//!
//! These errors travel *inside* the crate. The public page operations on
//! [`GalleryStore`](crate::gallery::GalleryStore) and
//! [`TieredStore`](crate::store::TieredStore) log them and answer with
//! `false`/`None`; only state transitions (`set_mode`) and constructors hand a
//! [`StoreError`] to the caller.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Disk cache read/write failure. Treated as a cache miss.
    #[error("transient cache error: {0}")]
    TransientIo(String),
    /// Download-directory I/O failure.
    #[error("download directory I/O error at {path}: {source}")]
    PersistentIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Transport failure or a non-success status.
    #[error("network error: {0}")]
    Network(String),
    #[error("response has no Content-Length")]
    MissingLength,
    #[error("received {actual} bytes, expected {expected}")]
    Verification { expected: u64, actual: u64 },
    /// The host answered with its blocked-access placeholder instead of the page.
    #[error("access blocked by the host (sad panda)")]
    SoftBan,
    #[error("download directory unavailable: {0}")]
    DownloadDir(String),
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl StoreError {
    pub(crate) fn persistent(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::PersistentIo {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Network(err.to_string())
    }
}

impl From<cacache::Error> for StoreError {
    fn from(err: cacache::Error) -> Self {
        StoreError::TransientIo(err.to_string())
    }
}

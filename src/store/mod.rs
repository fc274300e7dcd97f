//! Two-tier page storage behind one API.
//!
//! | Tier | Backend | Addressed by | Eviction |
//! |---|---|---|---|
//! | [`Tier::Transient`] | [`TransientTier`] (`cacache`) | [`CacheKey`] | LRU, size-bounded |
//! | [`Tier::Persistent`] | gallery download directory | directory + page index | never |
//!
//! [`TieredStore`] is the boundary where storage errors stop: every operation
//! logs its failure and reports `false`/`None`, which callers treat as "page not
//! available". Nothing here retries; the caller re-fetches.

pub mod dirnames;
pub mod persistent;
pub mod transient;

pub use dirnames::{DirnameTable, sanitize_dirname};
pub use persistent::StagedFile;
pub use transient::TransientTier;

use crate::extension::ImageExtension;
use crate::key::{CacheKey, PageIndex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which tier a page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Transient,
    Persistent,
}

/// Uniform existence/read/write/delete over both tiers.
#[derive(Debug, Clone)]
pub struct TieredStore {
    transient: Arc<TransientTier>,
}

impl TieredStore {
    pub fn new(transient: Arc<TransientTier>) -> Self {
        Self { transient }
    }

    pub fn transient(&self) -> &TransientTier {
        &self.transient
    }

    pub async fn exists_transient(&self, key: &CacheKey) -> bool {
        self.transient.contains(key).await.unwrap_or_else(|err| {
            warn!("cache lookup for {key} failed: {err}");
            false
        })
    }

    /// Returns `(found, is_gif)` for the first matching page file.
    pub async fn exists_persistent(&self, dir: &Path, index: PageIndex) -> (bool, bool) {
        match persistent::find(dir, index).await {
            Some((_, extension)) => (true, extension.is_gif()),
            None => (false, false),
        }
    }

    pub async fn find_persistent(
        &self,
        dir: &Path,
        index: PageIndex,
    ) -> Option<(PathBuf, ImageExtension)> {
        persistent::find(dir, index).await
    }

    pub async fn read_transient(&self, key: &CacheKey) -> Option<(ImageExtension, Vec<u8>)> {
        self.transient.read(key).await.unwrap_or_else(|err| {
            warn!("cache read for {key} failed: {err}");
            None
        })
    }

    pub async fn transient_extension(&self, key: &CacheKey) -> Option<ImageExtension> {
        self.transient.extension(key).await.unwrap_or_else(|err| {
            warn!("cache lookup for {key} failed: {err}");
            None
        })
    }

    pub async fn write_transient(
        &self,
        key: &CacheKey,
        extension: ImageExtension,
        data: &[u8],
    ) -> bool {
        match self.transient.write(key, extension, data).await {
            Ok(()) => true,
            Err(err) => {
                warn!("cache write for {key} failed: {err}");
                false
            }
        }
    }

    pub async fn write_persistent(
        &self,
        dir: &Path,
        index: PageIndex,
        extension: ImageExtension,
        data: &[u8],
    ) -> bool {
        match persistent::write(dir, index, extension, data).await {
            Ok(path) => {
                debug!("wrote {:?}", path);
                true
            }
            Err(err) => {
                warn!("writing page {index} to {:?} failed: {err}", dir);
                false
            }
        }
    }

    pub async fn remove_transient(&self, key: &CacheKey) -> bool {
        self.transient.remove(key).await.unwrap_or_else(|err| {
            warn!("cache removal for {key} failed: {err}");
            false
        })
    }

    pub async fn remove_persistent(&self, dir: &Path, index: PageIndex) -> bool {
        persistent::remove(dir, index).await.unwrap_or_else(|err| {
            warn!("removing page {index} from {:?} failed: {err}", dir);
            false
        })
    }

    /// Copy a cached page into the download directory.
    ///
    /// With `skip_if_not_gif`, only GIFs are copied; any other cached page is
    /// declined so that it gets downloaded again at original quality.
    pub async fn copy_transient_to_persistent(
        &self,
        key: &CacheKey,
        dir: &Path,
        index: PageIndex,
        skip_if_not_gif: bool,
    ) -> bool {
        let Some(extension) = self.transient_extension(key).await else {
            return false;
        };
        if skip_if_not_gif && !extension.is_gif() {
            debug!("not copying {key} ({extension}) from cache");
            return false;
        }
        let Some((extension, data)) = self.read_transient(key).await else {
            return false;
        };
        self.write_persistent(dir, index, extension, &data).await
    }
}

//! Transient tier: the size-bounded disk cache.
//!
//! Pages are stored in a [`cacache`] directory keyed by
//! [`CacheKey`](crate::key::CacheKey). Each index entry carries JSON metadata
//! `{"extension": ".png"}`, which plays the role of the extension sidecar: the
//! blob store itself knows nothing about image types.
//!
//! `cacache` verifies content integrity on every read, so a blob damaged on disk
//! surfaces as an integrity error. Such entries are removed and reported as a
//! miss; the page is simply fetched again.
//!
//! ## Eviction
//!
//! `cacache` never evicts on its own. [`TransientTier`] keeps an in-memory LRU
//! index (seeded from the entries' write times when the cache is opened) and,
//! after every write, removes least recently used entries until the total size
//! is back under the bound. The entry that was just written is never its own
//! victim. A content blob is only deleted together with the last key that
//! points at it. Rewriting a key removes its previous entry first, and opening
//! the cache trims it to the current bound.
//!
//! Existence checks read the index but do not count as a use.

use crate::error::StoreError;
use crate::extension::ImageExtension;
use crate::key::CacheKey;
use cacache::Integrity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const EXTENSION_FIELD: &str = "extension";

#[derive(Debug)]
struct LruEntry {
    size: u64,
    last_used: u64,
    integrity: Integrity,
}

#[derive(Debug, Default)]
struct LruIndex {
    clock: u64,
    total: u64,
    entries: HashMap<String, LruEntry>,
}

impl LruIndex {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, key: &str, size: u64, integrity: Integrity) {
        let last_used = self.tick();
        if let Some(old) = self.entries.insert(
            key.to_string(),
            LruEntry {
                size,
                last_used,
                integrity,
            },
        ) {
            self.total -= old.size;
        }
        self.total += size;
    }

    fn touch(&mut self, key: &str) {
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = now;
        }
    }

    fn forget(&mut self, key: &str) -> Option<LruEntry> {
        let entry = self.entries.remove(key)?;
        self.total -= entry.size;
        Some(entry)
    }

    fn is_shared(&self, integrity: &Integrity) -> bool {
        self.entries.values().any(|e| &e.integrity == integrity)
    }

    /// Pop least recently used entries until `total <= max_bytes`, sparing `keep`.
    ///
    /// Returns each victim's key and whether its content blob may be deleted.
    fn evict(&mut self, max_bytes: u64, keep: &str) -> Vec<(String, bool)> {
        let mut victims = Vec::new();
        while self.total > max_bytes {
            let oldest = self
                .entries
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            if let Some(entry) = self.forget(&key) {
                let remove_content = !self.is_shared(&entry.integrity);
                victims.push((key, remove_content));
            }
        }
        victims
    }
}

/// The process-wide disk cache shared by every gallery.
#[derive(Debug)]
pub struct TransientTier {
    root: PathBuf,
    max_bytes: u64,
    lru: Mutex<LruIndex>,
}

impl TransientTier {
    /// Open (or create) the cache at `root`, bounded to `max_bytes`.
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| {
            StoreError::TransientIo(format!("failed to create cache dir {:?}: {err}", root))
        })?;

        let mut existing: Vec<cacache::Metadata> = cacache::list_sync(&root)
            .filter_map(|entry| match entry {
                Ok(meta) => Some(meta),
                Err(err) => {
                    warn!("skipping unreadable cache index entry: {err}");
                    None
                }
            })
            .collect();
        existing.sort_by_key(|meta| meta.time);

        let mut lru = LruIndex::default();
        for meta in existing {
            lru.insert(&meta.key, meta.size as u64, meta.integrity);
        }
        // The bound may have shrunk since the entries were written.
        for (victim, remove_content) in lru.evict(max_bytes, "") {
            debug!("evicting {victim} from transient cache on open");
            if let Err(err) = cacache::index::RemoveOpts::new()
                .remove_fully(remove_content)
                .remove_sync(&root, &victim)
            {
                warn!("failed to evict {victim}: {err}");
            }
        }
        debug!(
            "opened transient cache {:?}: {} entries, {} bytes",
            root,
            lru.entries.len(),
            lru.total
        );

        Ok(Self {
            root,
            max_bytes,
            lru: Mutex::new(lru),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes currently accounted to live entries.
    pub fn usage(&self) -> u64 {
        self.lru.lock().total
    }

    pub fn len(&self) -> usize {
        self.lru.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live entry exists for `key`. Does not affect recency.
    pub async fn contains(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(cacache::metadata(&self.root, key.as_str()).await?.is_some())
    }

    /// Extension recorded for `key`, if the entry exists.
    pub async fn extension(&self, key: &CacheKey) -> Result<Option<ImageExtension>, StoreError> {
        let meta = cacache::metadata(&self.root, key.as_str()).await?;
        Ok(meta.map(|m| recorded_extension(&m.metadata)))
    }

    /// Read payload and extension. Corrupt entries are removed and read as absent.
    pub async fn read(
        &self,
        key: &CacheKey,
    ) -> Result<Option<(ImageExtension, Vec<u8>)>, StoreError> {
        let Some(meta) = cacache::metadata(&self.root, key.as_str()).await? else {
            return Ok(None);
        };
        let extension = recorded_extension(&meta.metadata);

        match cacache::read(&self.root, key.as_str()).await {
            Ok(data) => {
                self.lru.lock().touch(key.as_str());
                Ok(Some((extension, data)))
            }
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(err @ (cacache::Error::IntegrityError(_) | cacache::Error::SizeMismatch(_, _))) => {
                warn!("dropping corrupt cache entry {}: {err}", key);
                self.remove(key).await?;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Store `data` under `key`, then evict down to the size bound.
    pub async fn write(
        &self,
        key: &CacheKey,
        extension: ImageExtension,
        data: &[u8],
    ) -> Result<(), StoreError> {
        // Each write adds a fresh index entry and blob; drop the previous pair first.
        if self.remove(key).await? {
            debug!("replacing {key} in transient cache");
        }
        let mut writer = cacache::WriteOpts::new()
            .size(data.len())
            .metadata(serde_json::json!({ EXTENSION_FIELD: extension.as_str() }))
            .open(&self.root, key.as_str())
            .await?;
        writer
            .write_all(data)
            .await
            .map_err(|err| StoreError::TransientIo(format!("cache write failed: {err}")))?;
        let integrity = writer.commit().await?;

        let victims = {
            let mut lru = self.lru.lock();
            lru.insert(key.as_str(), data.len() as u64, integrity);
            lru.evict(self.max_bytes, key.as_str())
        };
        for (victim, remove_content) in victims {
            debug!("evicting {victim} from transient cache");
            if let Err(err) = self.remove_entry(&victim, remove_content).await {
                warn!("failed to evict {victim}: {err}");
            }
        }
        Ok(())
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let known = cacache::metadata(&self.root, key.as_str()).await?;
        let Some(meta) = known else {
            self.lru.lock().forget(key.as_str());
            return Ok(false);
        };
        let remove_content = {
            let mut lru = self.lru.lock();
            lru.forget(key.as_str());
            !lru.is_shared(&meta.integrity)
        };
        self.remove_entry(key.as_str(), remove_content).await?;
        Ok(true)
    }

    async fn remove_entry(&self, key: &str, remove_content: bool) -> Result<(), StoreError> {
        cacache::index::RemoveOpts::new()
            .remove_fully(remove_content)
            .remove(&self.root, key)
            .await?;
        Ok(())
    }
}

fn recorded_extension(metadata: &serde_json::Value) -> ImageExtension {
    metadata
        .get(EXTENSION_FIELD)
        .and_then(|v| v.as_str())
        .map(ImageExtension::normalize)
        .unwrap_or_default()
}

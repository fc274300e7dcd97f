//! Per-gallery store: decides which tier answers each request.
//!
//! A [`GalleryStore`] runs in one of two [`OperatingMode`]s:
//!
//! | Mode | `contains` | fetch destination | preferred source |
//! |---|---|---|---|
//! | `Read` | transient ∪ persistent | download dir if usable, else cache | cache |
//! | `Download` | persistent, or copy-up from cache | download dir only | download dir |
//!
//! The first switch to `Download` materializes the gallery's download
//! directory (`<location>/<sanitized "{gid}-{title}">`) and records its name in
//! the [`DirnameTable`], so a later title change does not orphan the files.
//!
//! Page operations never fail loudly: every error is logged and the answer is
//! `false` or `None`. Only [`GalleryStore::set_mode`] and
//! [`StoreContext::open`] return errors.

use crate::config::{StoreConfig, effective_cache_bytes};
use crate::error::StoreError;
use crate::extension::ImageExtension;
use crate::fetch::{Destination, Fetcher, ProgressFn};
use crate::key::{CacheKey, GalleryId, PageIndex, image_key};
use crate::locate::{InFlightPages, LocateError, PageLocator};
use crate::store::persistent::repair_gif;
use crate::store::{DirnameTable, Tier, TieredStore, TransientTier, sanitize_dirname};
use parking_lot::RwLock;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state every gallery store is built from.
///
/// Open one per process: it owns the disk cache, the HTTP client, and the
/// dirname table.
#[derive(Debug, Clone)]
pub struct StoreContext {
    transient: Arc<TransientTier>,
    fetcher: Fetcher,
    dirnames: Arc<DirnameTable>,
    download_root: PathBuf,
    skip_copy_image: bool,
    in_flight: InFlightPages,
}

impl StoreContext {
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let transient = TransientTier::open(
            config.cache.directory.clone(),
            effective_cache_bytes(&config.cache),
        )?;
        Ok(Self {
            transient: Arc::new(transient),
            fetcher: Fetcher::new(&config.http)?,
            dirnames: Arc::new(DirnameTable::load(&config.download.location)),
            download_root: config.download.location.clone(),
            skip_copy_image: config.download.skip_copy_image,
            in_flight: InFlightPages::new(),
        })
    }

    pub fn transient(&self) -> &TransientTier {
        &self.transient
    }

    pub fn in_flight(&self) -> &InFlightPages {
        &self.in_flight
    }

    /// Store for one gallery, starting in [`OperatingMode::Read`].
    pub fn gallery(&self, gid: GalleryId, title: impl Into<String>) -> GalleryStore {
        GalleryStore::new(self, gid, title.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
    #[default]
    Read,
    Download,
}

#[derive(Debug, Clone, Default)]
struct TierState {
    mode: OperatingMode,
    download_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct GalleryStore {
    gid: GalleryId,
    title: String,
    store: TieredStore,
    fetcher: Fetcher,
    dirnames: Arc<DirnameTable>,
    download_root: PathBuf,
    skip_copy_image: bool,
    in_flight: InFlightPages,
    state: RwLock<TierState>,
}

impl GalleryStore {
    fn new(ctx: &StoreContext, gid: GalleryId, title: String) -> Self {
        // A gallery downloaded earlier stays readable in read mode.
        let download_dir = ctx
            .dirnames
            .get(gid)
            .map(|name| ctx.download_root.join(name));
        if let Some(dir) = &download_dir {
            debug!("gallery {gid}: restored download dir {:?}", dir);
        }
        Self {
            gid,
            title,
            store: TieredStore::new(Arc::clone(&ctx.transient)),
            fetcher: ctx.fetcher.clone(),
            dirnames: Arc::clone(&ctx.dirnames),
            download_root: ctx.download_root.clone(),
            skip_copy_image: ctx.skip_copy_image,
            in_flight: ctx.in_flight.clone(),
            state: RwLock::new(TierState {
                mode: OperatingMode::Read,
                download_dir,
            }),
        }
    }

    pub fn gid(&self) -> GalleryId {
        self.gid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn mode(&self) -> OperatingMode {
        self.state.read().mode
    }

    pub fn download_dir(&self) -> Option<PathBuf> {
        self.state.read().download_dir.clone()
    }

    /// Switch modes. Entering `Download` creates the download directory if needed;
    /// if that fails the mode is left unchanged.
    pub fn set_mode(&self, mode: OperatingMode) -> Result<(), StoreError> {
        if mode == OperatingMode::Download {
            let dir = self.materialize_download_dir()?;
            let mut state = self.state.write();
            state.download_dir = Some(dir);
            state.mode = mode;
        } else {
            self.state.write().mode = mode;
        }
        debug!("gallery {}: mode {:?}", self.gid, mode);
        Ok(())
    }

    fn materialize_download_dir(&self) -> Result<PathBuf, StoreError> {
        let candidate = sanitize_dirname(&format!("{}-{}", self.gid, self.title));
        let dirname = self
            .dirnames
            .get_or_put(self.gid, &candidate)
            .map_err(|err| StoreError::DownloadDir(format!("recording dirname: {err}")))?;
        let dir = self.download_root.join(dirname);
        std::fs::create_dir_all(&dir)
            .map_err(|err| StoreError::DownloadDir(format!("creating {}: {err}", dir.display())))?;
        Ok(dir)
    }

    fn snapshot(&self) -> TierState {
        self.state.read().clone()
    }

    fn key(&self, index: PageIndex) -> CacheKey {
        image_key(self.gid, index)
    }

    pub async fn contains(&self, index: PageIndex) -> bool {
        let TierState { mode, download_dir } = self.snapshot();
        let key = self.key(index);
        match mode {
            OperatingMode::Read => {
                if self.store.exists_transient(&key).await {
                    return true;
                }
                match &download_dir {
                    Some(dir) => self.store.exists_persistent(dir, index).await.0,
                    None => false,
                }
            }
            OperatingMode::Download => {
                let Some(dir) = &download_dir else {
                    return false;
                };
                self.store.exists_persistent(dir, index).await.0
                    || self
                        .store
                        .copy_transient_to_persistent(&key, dir, index, self.skip_copy_image)
                        .await
            }
        }
    }

    /// Remove the page from both tiers. True if anything was deleted.
    pub async fn remove(&self, index: PageIndex) -> bool {
        let download_dir = self.snapshot().download_dir;
        let from_cache = self.store.remove_transient(&self.key(index)).await;
        let from_dir = match &download_dir {
            Some(dir) => self.store.remove_persistent(dir, index).await,
            None => false,
        };
        from_cache | from_dir
    }

    /// Download `url` as page `index` into the tier the current mode allows.
    pub async fn fetch_and_store(
        &self,
        index: PageIndex,
        url: &str,
        referer: Option<&str>,
        on_progress: &mut ProgressFn<'_>,
    ) -> bool {
        let TierState { mode, download_dir } = self.snapshot();
        let destination = Destination {
            key: self.key(index),
            index,
            persistent_dir: download_dir,
            allow_transient: mode == OperatingMode::Read,
        };
        match self
            .fetcher
            .fetch(&self.store, url, referer, &destination, on_progress)
            .await
        {
            Ok(committed) => {
                info!(
                    "gallery {} page {}: stored {} bytes ({}) in {:?} tier",
                    self.gid, index, committed.bytes, committed.extension, committed.tier
                );
                true
            }
            Err(StoreError::SoftBan) => {
                warn!("gallery {} page {}: soft-banned by the host", self.gid, index);
                false
            }
            Err(err) => {
                warn!("gallery {} page {}: fetch failed: {err}", self.gid, index);
                false
            }
        }
    }

    /// Locate and fetch a page, unless a fetch for it is already running.
    pub async fn fetch_page(
        &self,
        locator: &dyn PageLocator,
        index: PageIndex,
        on_progress: &mut ProgressFn<'_>,
    ) -> bool {
        let Some(_guard) = self.in_flight.try_acquire(self.gid, index) else {
            debug!("gallery {} page {}: already in flight", self.gid, index);
            return false;
        };
        let location = match locator.locate(self.gid, index).await {
            Ok(location) => location,
            Err(LocateError::SoftBan) => {
                warn!("gallery {} page {}: soft-banned while locating", self.gid, index);
                return false;
            }
            Err(err) => {
                warn!("gallery {} page {}: {err}", self.gid, index);
                return false;
            }
        };
        self.fetch_and_store(index, &location.url, location.referer.as_deref(), on_progress)
            .await
    }

    /// Copy the page's bytes to `destination`. The cache is tried first.
    pub async fn save_copy_to(&self, index: PageIndex, destination: &Path) -> bool {
        if let Some((_, data)) = self.store.read_transient(&self.key(index)).await {
            return match tokio::fs::write(destination, &data).await {
                Ok(()) => true,
                Err(err) => {
                    warn!("writing {:?} failed: {err}", destination);
                    false
                }
            };
        }
        let Some(dir) = self.snapshot().download_dir else {
            return false;
        };
        let Some((source, _)) = self.store.find_persistent(&dir, index).await else {
            return false;
        };
        match tokio::fs::copy(&source, destination).await {
            Ok(_) => true,
            Err(err) => {
                warn!("copying {:?} to {:?} failed: {err}", source, destination);
                false
            }
        }
    }

    /// Extension the page is stored with. The cache is tried first.
    pub async fn extension(&self, index: PageIndex) -> Option<ImageExtension> {
        if let Some(extension) = self.store.transient_extension(&self.key(index)).await {
            return Some(extension);
        }
        let dir = self.snapshot().download_dir?;
        self.store
            .find_persistent(&dir, index)
            .await
            .map(|(_, extension)| extension)
    }

    /// A readable source for the page.
    ///
    /// Read mode prefers the cache. Download-directory GIFs get their frame
    /// delays repaired before the source is handed out.
    pub async fn open_source(&self, index: PageIndex) -> Option<PageSource> {
        let TierState { mode, download_dir } = self.snapshot();
        if mode == OperatingMode::Read
            && let Some((extension, data)) = self.store.read_transient(&self.key(index)).await
        {
            return Some(PageSource {
                tier: Tier::Transient,
                extension,
                data: PageData::Memory(data),
            });
        }
        let dir = download_dir?;
        let (path, extension) = self.store.find_persistent(&dir, index).await?;
        if extension.is_gif()
            && let Err(err) = repair_gif(&path).await
        {
            warn!("repairing {:?} failed: {err}", path);
            return None;
        }
        Some(PageSource {
            tier: Tier::Persistent,
            extension,
            data: PageData::File(path),
        })
    }
}

#[derive(Debug, Clone)]
enum PageData {
    Memory(Vec<u8>),
    File(PathBuf),
}

/// A stored page, ready to be read or decoded.
#[derive(Debug, Clone)]
pub struct PageSource {
    pub tier: Tier,
    pub extension: ImageExtension,
    data: PageData,
}

impl PageSource {
    /// Path of the backing file, for pages served from a download directory.
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            PageData::File(path) => Some(path),
            PageData::Memory(_) => None,
        }
    }

    pub async fn bytes(&self) -> std::io::Result<Vec<u8>> {
        match &self.data {
            PageData::Memory(data) => Ok(data.clone()),
            PageData::File(path) => tokio::fs::read(path).await,
        }
    }

    /// Decode the page. The format is sniffed from the bytes; the stored
    /// extension is only a fallback, since unknown types are stored as `.jpg`.
    pub async fn decode(&self) -> Result<image::DynamicImage, image::ImageError> {
        let bytes = self.bytes().await?;
        let mut reader = image::ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        if reader.format().is_none() {
            reader.set_format(self.extension.image_format());
        }
        reader.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, DownloadConfig};
    use crate::locate::TemplateLocator;
    use crate::test_helpers::{Reply, TestServer};
    use tempfile::TempDir;

    fn config(tmp: &TempDir, skip_copy_image: bool) -> StoreConfig {
        StoreConfig {
            cache: CacheConfig {
                directory: tmp.path().join("cache"),
                ..CacheConfig::default()
            },
            download: DownloadConfig {
                location: tmp.path().join("downloads"),
                skip_copy_image,
            },
            ..StoreConfig::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    async fn fetch(store: &GalleryStore, server: &TestServer, index: PageIndex, path: &str) -> bool {
        store
            .fetch_and_store(index, &server.url(path), None, &mut |_, _, _| {})
            .await
    }

    // =========================================================================
    // Read mode
    // =========================================================================

    #[tokio::test]
    async fn read_mode_fetch_lands_in_cache_and_round_trips() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let body = payload(1024);
        let server = TestServer::start(vec![("/0", Reply::image("image/jpeg", body.clone()))]).await;

        assert!(fetch(&store, &server, 0, "/0").await);
        assert!(store.contains(0).await);
        assert_eq!(store.extension(0).await, Some(ImageExtension::Jpg));

        let source = store.open_source(0).await.unwrap();
        assert_eq!(source.tier, Tier::Transient);
        assert_eq!(source.bytes().await.unwrap(), body);

        let exported = tmp.path().join("export.jpg");
        assert!(store.save_copy_to(0, &exported).await);
        assert_eq!(std::fs::read(exported).unwrap(), body);
    }

    #[tokio::test]
    async fn truncated_fetch_is_not_contained() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let server =
            TestServer::start(vec![("/0", Reply::truncated("image/jpeg", 1024, payload(900)))]).await;

        assert!(!fetch(&store, &server, 0, "/0").await);
        assert!(!store.contains(0).await);
        assert!(store.open_source(0).await.is_none());
    }

    #[tokio::test]
    async fn remove_reports_deletion_once() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let server = TestServer::start(vec![("/0", Reply::image("image/png", payload(64)))]).await;
        assert!(fetch(&store, &server, 0, "/0").await);

        assert_eq!((store.remove(0).await, store.remove(0).await), (true, false));
        assert!(!store.contains(0).await);
    }

    #[tokio::test]
    async fn unsupported_type_is_stored_as_jpg() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(1), "t");
        let server = TestServer::start(vec![("/0", Reply::image("image/bmp", payload(16)))]).await;
        assert!(fetch(&store, &server, 0, "/0").await);
        assert_eq!(store.extension(0).await, Some(ImageExtension::Jpg));
    }

    #[tokio::test]
    async fn gif_stays_decodable() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(7), "Anim");
        let gif = crate::gif::tests::tiny_gif(&[0, 1]);
        let server = TestServer::start(vec![("/0", Reply::image("image/gif", gif))]).await;

        assert!(fetch(&store, &server, 0, "/0").await);
        let source = store.open_source(0).await.unwrap();
        assert_eq!(source.extension, ImageExtension::Gif);
        let image = source.decode().await.unwrap();
        assert_eq!((image.width(), image.height()), (1, 1));
    }

    // =========================================================================
    // Mode transitions
    // =========================================================================

    #[tokio::test]
    async fn download_mode_writes_canonical_file() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Some: Title");
        store.set_mode(OperatingMode::Download).unwrap();

        let dir = store.download_dir().unwrap();
        assert_eq!(dir, tmp.path().join("downloads/42-Some Title"));

        let server = TestServer::start(vec![("/0", Reply::image("image/jpeg", payload(1024)))]).await;
        assert!(fetch(&store, &server, 0, "/0").await);
        assert!(dir.join("00000001.jpg").exists());
        assert!(!ctx.transient().contains(&image_key(GalleryId(42), 0)).await.unwrap());

        let source = store.open_source(0).await.unwrap();
        assert_eq!(source.tier, Tier::Persistent);
        assert_eq!(source.path(), Some(dir.join("00000001.jpg").as_path()));
    }

    #[tokio::test]
    async fn switching_to_download_keeps_persistent_pages() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        store.set_mode(OperatingMode::Download).unwrap();
        let server = TestServer::start(vec![("/0", Reply::image("image/png", payload(32)))]).await;
        assert!(fetch(&store, &server, 0, "/0").await);

        store.set_mode(OperatingMode::Read).unwrap();
        assert!(store.contains(0).await);
        store.set_mode(OperatingMode::Download).unwrap();
        assert!(store.contains(0).await);
    }

    #[tokio::test]
    async fn download_mode_copies_cached_pages_up() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let server = TestServer::start(vec![("/0", Reply::image("image/png", payload(32)))]).await;
        assert!(fetch(&store, &server, 0, "/0").await);

        store.set_mode(OperatingMode::Download).unwrap();
        assert!(store.contains(0).await);
        assert!(store.download_dir().unwrap().join("00000001.png").exists());
    }

    #[tokio::test]
    async fn skip_copy_declines_cached_png() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, true)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let server = TestServer::start(vec![("/0", Reply::image("image/png", payload(32)))]).await;
        assert!(fetch(&store, &server, 0, "/0").await);

        store.set_mode(OperatingMode::Download).unwrap();
        assert!(!store.contains(0).await);
        assert!(!store.download_dir().unwrap().join("00000001.png").exists());
    }

    #[tokio::test]
    async fn failed_materialization_keeps_read_mode() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, false);
        // A regular file where the download root should be
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        cfg.download.location = blocker.join("downloads");
        let ctx = StoreContext::open(&cfg).unwrap();
        let store = ctx.gallery(GalleryId(3), "t");

        assert!(matches!(
            store.set_mode(OperatingMode::Download),
            Err(StoreError::DownloadDir(_))
        ));
        assert_eq!(store.mode(), OperatingMode::Read);
    }

    #[tokio::test]
    async fn new_store_restores_recorded_dirname() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, false);
        {
            let ctx = StoreContext::open(&cfg).unwrap();
            let store = ctx.gallery(GalleryId(42), "Original Title");
            store.set_mode(OperatingMode::Download).unwrap();
            let dir = store.download_dir().unwrap();
            std::fs::write(dir.join("00000003.jpg"), b"jpg").unwrap();
        }

        let ctx = StoreContext::open(&cfg).unwrap();
        let store = ctx.gallery(GalleryId(42), "Renamed Title");
        assert_eq!(store.mode(), OperatingMode::Read);
        assert!(store.contains(2).await);
        store.set_mode(OperatingMode::Download).unwrap();
        assert_eq!(
            store.download_dir().unwrap(),
            tmp.path().join("downloads/42-Original Title")
        );
    }

    // =========================================================================
    // Locating and in-flight pages
    // =========================================================================

    #[tokio::test]
    async fn fetch_page_uses_locator_and_referer() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let server = TestServer::start(vec![("/42/2", Reply::image("image/jpeg", payload(10)))]).await;
        let locator =
            TemplateLocator::new(server.url("/{gid}/{page}")).with_referer("http://gallery/42");

        assert!(store.fetch_page(&locator, 1, &mut |_, _, _| {}).await);
        assert!(store.contains(1).await);
        assert_eq!(server.requests()[0].referer.as_deref(), Some("http://gallery/42"));
        assert!(ctx.in_flight().is_empty());
    }

    #[tokio::test]
    async fn fetch_page_rejects_duplicate_in_flight() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let locator = TemplateLocator::new("http://127.0.0.1:9/{page}");

        let _held = ctx.in_flight().try_acquire(GalleryId(42), 0).unwrap();
        assert!(!store.fetch_page(&locator, 0, &mut |_, _, _| {}).await);
    }

    #[tokio::test]
    async fn soft_ban_is_not_stored() {
        let tmp = TempDir::new().unwrap();
        let ctx = StoreContext::open(&config(&tmp, false)).unwrap();
        let store = ctx.gallery(GalleryId(42), "Title");
        let reply = Reply::image("image/gif", payload(9615))
            .with_header("Content-Disposition", "inline; filename=\"sadpanda.jpg\"");
        let server = TestServer::start(vec![("/0", reply)]).await;

        assert!(!fetch(&store, &server, 0, "/0").await);
        assert!(!store.contains(0).await);
    }
}

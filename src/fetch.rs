//! Fetch & persist pipeline for a single page.
//!
//! ```text
//! Idle → Requesting → Streaming → Verifying → Committed
//!            │            │           │
//!            └────────────┴───────────┴──→ Failed
//! ```
//!
//! - **Requesting**: `GET url` with the `Referer` header. A status ≥ 400, a
//!   soft-ban placeholder, or a response without `Content-Length` fails here
//!   before anything is written.
//! - **Streaming**: body chunks go straight to the destination sink and the
//!   progress callback sees `(expected, received, delta)` after every chunk.
//! - **Verifying**: the received byte count must equal `Content-Length`; GIFs
//!   get their frame delays repaired.
//! - **Committed**: the page becomes visible under its key or canonical
//!   filename. Until then nothing is visible, so a failed or cancelled fetch
//!   leaves the page absent and safe to retry.
//!
//! The pipeline holds no state between pages; any number of fetches may run
//! concurrently as long as no two target the same page.

use crate::config::HttpConfig;
use crate::error::StoreError;
use crate::extension::ImageExtension;
use crate::gif;
use crate::key::{CacheKey, PageIndex};
use crate::store::{StagedFile, Tier, TieredStore};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, REFERER};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Progress callback: `(total_expected, total_so_far, delta_since_last_call)`.
pub type ProgressFn<'a> = dyn FnMut(u64, u64, u64) + Send + 'a;

const SAD_PANDA_DISPOSITION: &str = "inline; filename=\"sadpanda.jpg\"";
const SAD_PANDA_TYPE: &str = "image/gif";
const SAD_PANDA_LENGTH: &str = "9615";

/// Pipeline states, reported at `debug` level as a fetch advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Requesting,
    Streaming,
    Verifying,
    Committed,
    Failed,
}

/// Where a fetch is allowed to put the page.
#[derive(Debug, Clone)]
pub struct Destination {
    pub key: CacheKey,
    pub index: PageIndex,
    /// Download directory to write into, if one is materialized.
    pub persistent_dir: Option<PathBuf>,
    /// Whether the transient tier may receive the page. Only in read mode.
    pub allow_transient: bool,
}

/// A successfully committed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub tier: Tier,
    pub extension: ImageExtension,
    pub bytes: u64,
}

enum Sink {
    Persistent(StagedFile),
    Transient(Vec<u8>),
}

impl Sink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        match self {
            Sink::Persistent(staged) => staged.write_all(chunk).await,
            Sink::Transient(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    async fn commit(
        self,
        store: &TieredStore,
        key: &CacheKey,
        extension: ImageExtension,
    ) -> Result<Tier, StoreError> {
        match self {
            Sink::Persistent(staged) => {
                let path = staged.commit(extension).await?;
                debug!("committed {:?}", path);
                Ok(Tier::Persistent)
            }
            Sink::Transient(mut buffer) => {
                if extension.is_gif() {
                    if let Err(err) = gif::repair_frame_delays(&mut buffer) {
                        warn!("{key} is labelled GIF but could not be repaired: {err}");
                    }
                }
                store.transient().write(key, extension, &buffer).await?;
                Ok(Tier::Transient)
            }
        }
    }
}

/// Streaming HTTP fetcher shared by every gallery.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client })
    }

    /// Fetch `url` and commit it to the destination tier.
    pub async fn fetch(
        &self,
        store: &TieredStore,
        url: &str,
        referer: Option<&str>,
        destination: &Destination,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<Committed, StoreError> {
        let index = destination.index;
        let result = self
            .run(store, url, referer, destination, on_progress)
            .await;
        match &result {
            Ok(committed) => debug!(
                "page {index}: {:?} ({:?}, {}, {} bytes)",
                FetchState::Committed,
                committed.tier,
                committed.extension,
                committed.bytes
            ),
            Err(err) => debug!("page {index}: {:?} ({err})", FetchState::Failed),
        }
        result
    }

    async fn run(
        &self,
        store: &TieredStore,
        url: &str,
        referer: Option<&str>,
        destination: &Destination,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<Committed, StoreError> {
        let index = destination.index;
        debug!("page {index}: {:?} {url}", FetchState::Requesting);

        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        let mut response = request.send().await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(StoreError::Network(format!("{url} returned {status}")));
        }
        if is_sad_panda(response.headers()) {
            return Err(StoreError::SoftBan);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let mut extension = content_type
            .as_deref()
            .map(ImageExtension::from_content_type)
            .unwrap_or_default();
        let mut sniff = content_type
            .as_deref()
            .is_none_or(|ct| !ct.trim_start().starts_with("image/"));
        let expected = response.content_length().ok_or(StoreError::MissingLength)?;

        let mut sink = open_sink(destination, expected).await?;

        debug!("page {index}: {:?} {expected} bytes", FetchState::Streaming);
        let mut received: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            if sniff {
                if let Some(sniffed) = ImageExtension::sniff(&chunk) {
                    extension = sniffed;
                }
                sniff = false;
            }
            let delta = chunk.len() as u64;
            received += delta;
            if received > expected {
                return Err(StoreError::Verification {
                    expected,
                    actual: received,
                });
            }
            sink.write(&chunk).await?;
            on_progress(expected, received, delta);
        }

        debug!("page {index}: {:?}", FetchState::Verifying);
        if received != expected {
            return Err(StoreError::Verification {
                expected,
                actual: received,
            });
        }

        let tier = sink.commit(store, &destination.key, extension).await?;
        Ok(Committed {
            tier,
            extension,
            bytes: received,
        })
    }
}

/// Pick the sink for this fetch.
///
/// A download directory takes precedence. If staging a file there fails, read
/// mode falls back to the transient tier; download mode has no fallback.
async fn open_sink(destination: &Destination, expected: u64) -> Result<Sink, StoreError> {
    if let Some(dir) = &destination.persistent_dir {
        match StagedFile::create(dir, destination.index).await {
            Ok(staged) => return Ok(Sink::Persistent(staged)),
            Err(err) if destination.allow_transient => {
                warn!(
                    "page {}: cannot write to {:?} ({err}), using cache",
                    destination.index, dir
                );
            }
            Err(err) => return Err(err),
        }
    }
    if destination.allow_transient {
        let capacity = usize::try_from(expected).unwrap_or(0).min(64 * 1024 * 1024);
        Ok(Sink::Transient(Vec::with_capacity(capacity)))
    } else {
        Err(StoreError::DownloadDir(
            "download mode without a download directory".into(),
        ))
    }
}

/// The host's blocked-access placeholder: a fixed GIF served inline.
pub fn is_sad_panda(headers: &HeaderMap) -> bool {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    header(CONTENT_DISPOSITION) == Some(SAD_PANDA_DISPOSITION)
        && header(CONTENT_TYPE) == Some(SAD_PANDA_TYPE)
        && header(CONTENT_LENGTH) == Some(SAD_PANDA_LENGTH)
}

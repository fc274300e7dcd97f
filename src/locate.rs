//! Resolving a page to the URL of its image.
//!
//! The store does not parse gallery pages itself. A [`PageLocator`] answers
//! "where is the image for page N of gallery G", and the store fetches it. The
//! CLI uses a [`TemplateLocator`]; an embedding application plugs in whatever
//! talks to the real host.
//!
//! [`InFlightPages`] makes sure at most one fetch per page runs at a time.

use crate::key::{GalleryId, PageIndex};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Where to download a page image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLocation {
    pub url: String,
    pub referer: Option<String>,
    /// Host-specific token for re-locating the same page later, if any.
    pub token: Option<String>,
}

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("access blocked by the host (sad panda)")]
    SoftBan,
    #[error("page {index} of gallery {gid} not found")]
    NotFound { gid: GalleryId, index: PageIndex },
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PageLocator: Send + Sync {
    async fn locate(&self, gid: GalleryId, index: PageIndex) -> Result<PageLocation, LocateError>;
}

/// Builds image URLs from a template.
///
/// Placeholders: `{gid}`, `{index}` (0-based) and `{page}` (1-based).
#[derive(Debug, Clone)]
pub struct TemplateLocator {
    template: String,
    referer: Option<String>,
}

impl TemplateLocator {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            referer: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn url_for(&self, gid: GalleryId, index: PageIndex) -> String {
        self.template
            .replace("{gid}", &gid.to_string())
            .replace("{index}", &index.to_string())
            .replace("{page}", &(u64::from(index) + 1).to_string())
    }
}

#[async_trait]
impl PageLocator for TemplateLocator {
    async fn locate(&self, gid: GalleryId, index: PageIndex) -> Result<PageLocation, LocateError> {
        Ok(PageLocation {
            url: self.url_for(gid, index),
            referer: self.referer.clone(),
            token: None,
        })
    }
}

/// Pages with a fetch currently running.
#[derive(Debug, Clone, Default)]
pub struct InFlightPages {
    pages: Arc<Mutex<HashSet<(GalleryId, PageIndex)>>>,
}

impl InFlightPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a page. `None` if another fetch already holds it.
    pub fn try_acquire(&self, gid: GalleryId, index: PageIndex) -> Option<PageGuard> {
        if self.pages.lock().insert((gid, index)) {
            Some(PageGuard {
                pages: Arc::clone(&self.pages),
                page: (gid, index),
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, gid: GalleryId, index: PageIndex) -> bool {
        self.pages.lock().contains(&(gid, index))
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its page when dropped.
#[derive(Debug)]
pub struct PageGuard {
    pages: Arc<Mutex<HashSet<(GalleryId, PageIndex)>>>,
    page: (GalleryId, PageIndex),
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pages.lock().remove(&self.page);
    }
}

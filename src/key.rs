//! Cache keys and canonical page filenames.
//!
//! Every page of every gallery is addressed two ways:
//!
//! - **Cache key**: `image:{gid}:{index}`, the key under which the page lives in
//!   the transient tier. Both parts are decimal integers, so the `:` separator can
//!   never appear inside either of them and distinct pairs never collide.
//! - **Canonical filename**: `{index + 1:08}{ext}`, the name of the page file in a
//!   gallery's download directory. Page numbers are 1-based on disk so that a
//!   file browser lists `00000001.jpg` as the first page.
//!
//! ```text
//! (42, 0)  →  image:42:0      00000001.jpg
//! (42, 9)  →  image:42:9      00000010.png
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a gallery on the remote host. Supplied externally, never parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GalleryId(pub u64);

impl fmt::Display for GalleryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based page index within a gallery.
pub type PageIndex = u32;

/// Key of one page's blob in the transient tier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.0).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the cache key for a page.
pub fn image_key(gid: GalleryId, index: PageIndex) -> CacheKey {
    CacheKey(format!("image:{}:{}", gid.0, index))
}

/// Canonical filename of a page inside a download directory.
///
/// `extension` includes the leading dot.
pub fn page_filename(index: PageIndex, extension: &str) -> String {
    format!("{:08}{}", u64::from(index) + 1, extension)
}

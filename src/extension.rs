//! Supported image extensions.
//!
//! The store only ever writes three extensions. Anything the remote host sends
//! that is not one of them is stored as the default (`.jpg`) rather than being
//! rejected: an unknown content type is never a reason to drop a page.
//!
//! | Variant | Extension | Post-write handling |
//! |---|---|---|
//! | [`Jpg`](ImageExtension::Jpg) | `.jpg` | none (default) |
//! | [`Png`](ImageExtension::Png) | `.png` | none |
//! | [`Gif`](ImageExtension::Gif) | `.gif` | frame delays rewritten by [`crate::gif`] |
//!
//! Download directories written by older releases may hold `.jpeg` files, so
//! lookups in the persistent tier also scan that spelling ([`PERSISTENT_SCAN`]).

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the fixed set of extensions the store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageExtension {
    Jpg,
    Png,
    Gif,
}

/// Supported extensions in priority order. The first entry is the default.
pub const SUPPORTED: [ImageExtension; 3] =
    [ImageExtension::Jpg, ImageExtension::Png, ImageExtension::Gif];

/// Filename suffixes probed when looking a page up in a download directory,
/// in priority order, paired with the extension they are read back as.
pub const PERSISTENT_SCAN: [(&str, ImageExtension); 4] = [
    (".jpg", ImageExtension::Jpg),
    (".png", ImageExtension::Png),
    (".gif", ImageExtension::Gif),
    (".jpeg", ImageExtension::Jpg),
];

impl ImageExtension {
    pub const DEFAULT: ImageExtension = SUPPORTED[0];

    /// Extension with its leading dot.
    pub fn as_str(self) -> &'static str {
        match self {
            ImageExtension::Jpg => ".jpg",
            ImageExtension::Png => ".png",
            ImageExtension::Gif => ".gif",
        }
    }

    /// Map a candidate extension (with leading dot) onto the supported set.
    ///
    /// Exact, case-insensitive matches are returned as-is; everything else,
    /// `.jpeg` included, becomes [`ImageExtension::DEFAULT`].
    pub fn normalize(candidate: &str) -> ImageExtension {
        SUPPORTED
            .into_iter()
            .find(|ext| ext.as_str().eq_ignore_ascii_case(candidate))
            .unwrap_or(Self::DEFAULT)
    }

    /// Map a `Content-Type` header value via its subtype.
    ///
    /// `image/png; charset=binary` → `.png`, `image/jpeg` → `.jpg`,
    /// `image/bmp` → `.jpg`.
    pub fn from_content_type(content_type: &str) -> ImageExtension {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        let subtype = essence.split_once('/').map(|(_, sub)| sub).unwrap_or(essence);
        Self::normalize(&format!(".{subtype}"))
    }

    /// Guess the extension from the leading bytes of a payload.
    ///
    /// Returns `None` when the bytes are not a recognisable image at all, so
    /// the caller can keep whatever it already decided.
    pub fn sniff(bytes: &[u8]) -> Option<ImageExtension> {
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(ImageExtension::Jpg),
            ImageFormat::Png => Some(ImageExtension::Png),
            ImageFormat::Gif => Some(ImageExtension::Gif),
            _ => Some(Self::DEFAULT),
        }
    }

    pub fn is_gif(self) -> bool {
        self == ImageExtension::Gif
    }

    pub(crate) fn image_format(self) -> ImageFormat {
        match self {
            ImageExtension::Jpg => ImageFormat::Jpeg,
            ImageExtension::Png => ImageFormat::Png,
            ImageExtension::Gif => ImageFormat::Gif,
        }
    }
}

impl Default for ImageExtension {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ImageExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

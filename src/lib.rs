//! # Gallery Store
//!
//! Content store for paginated image galleries. Every page of every gallery
//! lives in one of two tiers:
//!
//! - a **transient** tier: one size-bounded LRU disk cache shared by all
//!   galleries, for pages that are only being read;
//! - a **persistent** tier: one download directory per gallery, for pages the
//!   user asked to keep. Never evicted.
//!
//! A [`gallery::GalleryStore`] answers "is page N available, where, and as
//! what format" and fetches pages from HTTP into whichever tier its current
//! mode allows.
//!
//! # Architecture
//!
//! ```text
//!             GalleryStore (mode policy)
//!              │            │
//!          Fetcher      TieredStore
//!      (HTTP → verify)   │        │
//!                  TransientTier  download dir
//!                   (cacache)     (canonical filenames)
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`key`] | `image:{gid}:{index}` cache keys and `00000001.jpg` filenames |
//! | [`extension`] | The closed set of stored extensions, normalization and sniffing |
//! | [`gif`] | In-place repair of GIF frame delays |
//! | [`store`] | The two tiers behind one API, plus the gallery dirname table |
//! | [`fetch`] | Streaming GET, progress, length verification, commit |
//! | [`gallery`] | Read/download mode policy and the per-gallery operations |
//! | [`locate`] | Page URL resolution seam and in-flight page guard |
//! | [`config`] | `store.toml` loading, validation, and merging |
//! | [`error`] | Error types |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Nothing Partial Is Ever Visible
//!
//! A page appears under its cache key or canonical filename only after every
//! byte promised by `Content-Length` has arrived. Download-directory pages are
//! staged under a hidden name and renamed; cache pages are committed by
//! `cacache`, which checks the declared size. A failed, truncated, or
//! cancelled fetch leaves the page absent, so the caller simply retries.
//!
//! ## Errors Stop at the Store
//!
//! Page operations answer `bool`/`Option` and log what went wrong. A missing
//! page and a broken page look the same to a reader: both mean "fetch it
//! again". Only configuration and mode transitions return errors.
//!
//! ## Download Directories Keep Their First Name
//!
//! A gallery's directory is named `"{gid}-{title}"` when it is first created,
//! and that name is recorded. Later title changes do not move or orphan it.

pub mod config;
pub mod error;
pub mod extension;
pub mod fetch;
pub mod gallery;
pub mod gif;
pub mod key;
pub mod locate;
pub mod output;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

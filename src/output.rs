//! CLI output formatting.
//!
//! Every page is shown by its 1-based page number, zero-padded to three
//! digits, followed by what happened to it. Gallery-level context comes first
//! as a header with indented detail lines:
//!
//! ```text
//! Gallery 42 Some Title [download]
//!     Directory: downloads/42-Some Title
//! 001 fetched (.jpg)
//! 002 already stored
//! 003 failed
//!
//! Downloaded 1 page, 1 already stored, 1 failed
//! ```
//!
//! # Architecture
//!
//! Each output has a `format_*` function (returns `String` or `Vec<String>`)
//! for testability and, where it is printed as a block, a `print_*` wrapper
//! that writes to stdout. Format functions are pure: no I/O, no side effects.

use crate::extension::ImageExtension;
use crate::gallery::OperatingMode;
use crate::key::{GalleryId, PageIndex};
use std::path::Path;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 0-based page index as a 3-digit zero-padded page number.
fn format_page(index: PageIndex) -> String {
    format!("{:0>3}", u64::from(index) + 1)
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn plural(count: usize, one: &str, many: &str) -> String {
    if count == 1 {
        format!("{count} {one}")
    } else {
        format!("{count} {many}")
    }
}

fn mode_label(mode: OperatingMode) -> &'static str {
    match mode {
        OperatingMode::Read => "read",
        OperatingMode::Download => "download",
    }
}

fn mebibytes(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

// ============================================================================
// Gallery
// ============================================================================

/// Gallery header plus its download directory, if one is bound.
pub fn format_gallery_header(
    gid: GalleryId,
    title: &str,
    mode: OperatingMode,
    download_dir: Option<&Path>,
) -> Vec<String> {
    let mut lines = vec![if title.is_empty() {
        format!("Gallery {} [{}]", gid, mode_label(mode))
    } else {
        format!("Gallery {} {} [{}]", gid, title, mode_label(mode))
    }];
    if let Some(dir) = download_dir {
        lines.push(format!("{}Directory: {}", indent(1), dir.display()));
    }
    lines
}

pub fn print_gallery_header(
    gid: GalleryId,
    title: &str,
    mode: OperatingMode,
    download_dir: Option<&Path>,
) {
    for line in format_gallery_header(gid, title, mode, download_dir) {
        println!("{}", line);
    }
}

// ============================================================================
// Pages
// ============================================================================

/// What a fetch request ended with, as far as the CLI reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Fetched(Option<ImageExtension>),
    AlreadyStored,
    Failed,
}

pub fn format_page_outcome(index: PageIndex, outcome: PageOutcome) -> String {
    let page = format_page(index);
    match outcome {
        PageOutcome::Fetched(Some(ext)) => format!("{} fetched ({})", page, ext),
        PageOutcome::Fetched(None) => format!("{} fetched", page),
        PageOutcome::AlreadyStored => format!("{} already stored", page),
        PageOutcome::Failed => format!("{} failed", page),
    }
}

/// Progress line for an in-progress fetch.
///
/// ```text
///     001 512/1024 bytes (50%)
/// ```
pub fn format_progress(index: PageIndex, expected: u64, received: u64) -> String {
    let percent = if expected == 0 {
        100
    } else {
        received.saturating_mul(100) / expected
    };
    format!(
        "{}{} {}/{} bytes ({}%)",
        indent(1),
        format_page(index),
        received,
        expected,
        percent
    )
}

pub fn format_contains(index: PageIndex, found: bool) -> String {
    format!(
        "{} {}",
        format_page(index),
        if found { "present" } else { "missing" }
    )
}

pub fn format_removal(index: PageIndex, removed: bool) -> String {
    format!(
        "{} {}",
        format_page(index),
        if removed { "removed" } else { "nothing to remove" }
    )
}

pub fn format_extension(index: PageIndex, extension: Option<ImageExtension>) -> String {
    match extension {
        Some(ext) => format!("{} {}", format_page(index), ext),
        None => format!("{} not stored", format_page(index)),
    }
}

pub fn format_export(index: PageIndex, destination: &Path, saved: bool) -> String {
    if saved {
        format!("{} → {}", format_page(index), destination.display())
    } else {
        format!("{} not stored", format_page(index))
    }
}

// ============================================================================
// Summaries
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub fetched: usize,
    pub already_stored: usize,
    pub failed: usize,
}

impl DownloadSummary {
    pub fn record(&mut self, outcome: PageOutcome) {
        match outcome {
            PageOutcome::Fetched(_) => self.fetched += 1,
            PageOutcome::AlreadyStored => self.already_stored += 1,
            PageOutcome::Failed => self.failed += 1,
        }
    }
}

pub fn format_download_summary(summary: &DownloadSummary) -> String {
    format!(
        "Downloaded {}, {} already stored, {} failed",
        plural(summary.fetched, "page", "pages"),
        summary.already_stored,
        summary.failed
    )
}

/// Transient cache usage block.
///
/// ```text
/// Cache
///     Directory: .gallery-store/cache
///     Entries: 12
///     Usage: 3.4 MiB of 320.0 MiB
/// ```
pub fn format_cache_status(directory: &Path, entries: usize, usage: u64, max: u64) -> Vec<String> {
    vec![
        "Cache".to_string(),
        format!("{}Directory: {}", indent(1), directory.display()),
        format!("{}Entries: {}", indent(1), entries),
        format!("{}Usage: {} of {}", indent(1), mebibytes(usage), mebibytes(max)),
    ]
}

pub fn print_cache_status(directory: &Path, entries: usize, usage: u64, max: u64) {
    for line in format_cache_status(directory, entries, usage, max) {
        println!("{}", line);
    }
}

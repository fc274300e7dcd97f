//! Persisted mapping from gallery id to download directory name.
//!
//! A gallery's download directory is named after the gallery title at the time
//! it was first downloaded. Titles change (and differ between languages), so the
//! name is recorded once and looked up afterwards instead of being recomputed.
//!
//! The table is a small JSON file next to the download directories:
//!
//! ```json
//! { "version": 1, "entries": { "42": "42-Some Gallery Title" } }
//! ```
//!
//! Like the cache manifest it is modelled on, a missing, corrupt, or
//! wrong-version file loads as an empty table.

use crate::key::GalleryId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the table file within the download location.
pub const TABLE_FILENAME: &str = ".dirnames.json";

const TABLE_VERSION: u32 = 1;

/// Longest directory name produced by [`sanitize_dirname`], in characters.
const MAX_DIRNAME_CHARS: usize = 128;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableFile {
    version: u32,
    entries: BTreeMap<u64, String>,
}

/// The `GalleryId → directory name` table, shared by all gallery stores.
#[derive(Debug)]
pub struct DirnameTable {
    path: PathBuf,
    entries: Mutex<BTreeMap<u64, String>>,
}

impl DirnameTable {
    /// Load the table stored in `location`. Never fails; see the module docs.
    pub fn load(location: &Path) -> Self {
        let path = location.join(TABLE_FILENAME);
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<TableFile>(&content).ok())
            .filter(|file| file.version == TABLE_VERSION)
            .map(|file| file.entries)
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, gid: GalleryId) -> Option<String> {
        self.entries.lock().get(&gid.0).cloned()
    }

    /// Record `dirname` for `gid` and save the table if anything changed.
    pub fn put(&self, gid: GalleryId, dirname: &str) -> io::Result<()> {
        let mut entries = self.entries.lock();
        if entries.get(&gid.0).map(String::as_str) == Some(dirname) {
            return Ok(());
        }
        entries.insert(gid.0, dirname.to_string());
        self.save(&entries)
    }

    /// Return the recorded name for `gid`, recording `candidate` if there is none.
    ///
    /// Concurrent callers for the same gallery all get the first recorded name.
    pub fn get_or_put(&self, gid: GalleryId, candidate: &str) -> io::Result<String> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&gid.0) {
            return Ok(existing.clone());
        }
        entries.insert(gid.0, candidate.to_string());
        self.save(&entries)?;
        Ok(candidate.to_string())
    }

    fn save(&self, entries: &BTreeMap<u64, String>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = TableFile {
            version: TABLE_VERSION,
            entries: entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, &self.path)
    }
}

/// Turn an arbitrary title into a safe single path component.
///
/// Removes path separators, characters reserved on common filesystems, and
/// control characters; collapses whitespace; strips leading/trailing dots and
/// spaces; and caps the length. Never returns an empty string.
pub fn sanitize_dirname(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed: String = collapsed
        .trim_matches(|c: char| c == '.' || c == ' ')
        .chars()
        .take(MAX_DIRNAME_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

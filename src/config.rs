//! Store configuration.
//!
//! Handles loading, validating, and merging `store.toml`. Stock defaults are the
//! base layer; the user file only needs the keys it wants to override.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [cache]
//! directory = ".gallery-store/cache"  # Transient tier (LRU disk cache)
//! max_size_mb = 320                   # Clamped to 160..=5120
//!
//! [download]
//! location = "downloads"              # Root of per-gallery download directories
//! skip_copy_image = false             # Re-download instead of copying cached non-GIF pages
//!
//! [http]
//! user_agent = "Mozilla/5.0 ..."
//! connect_timeout_secs = 10
//! timeout_secs = 60
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config filename looked up by the CLI.
pub const CONFIG_FILENAME: &str = "store.toml";

/// Bounds applied to `cache.max_size_mb`.
pub const MIN_CACHE_MB: u64 = 160;
pub const MAX_CACHE_MB: u64 = 5120;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Store configuration loaded from `store.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Transient tier settings.
    pub cache: CacheConfig,
    /// Persistent tier settings.
    pub download: DownloadConfig,
    /// HTTP client settings for page fetches.
    pub http: HttpConfig,
}

impl StoreConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "cache.directory must not be empty".into(),
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(ConfigError::Validation(
                "http.user_agent must not be empty".into(),
            ));
        }
        if self.http.connect_timeout_secs == 0 || self.http.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "http timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Transient tier (disk cache) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory managed by the disk cache. Shared by every gallery.
    pub directory: PathBuf,
    /// Size bound in MiB. Values outside `160..=5120` are clamped.
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".gallery-store/cache"),
            max_size_mb: 320,
        }
    }
}

/// Resolve the effective cache bound in bytes.
///
/// Small values would thrash a reader paging through one large gallery, huge
/// ones would eat the disk, so the configured value is clamped, not rejected.
pub fn effective_cache_bytes(config: &CacheConfig) -> u64 {
    config.max_size_mb.clamp(MIN_CACHE_MB, MAX_CACHE_MB) * 1024 * 1024
}

/// Persistent tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Root directory under which each gallery gets its own directory.
    pub location: PathBuf,
    /// In download mode, copy only GIFs from the cache and fetch every other
    /// page again at original quality.
    pub skip_copy_image: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::from("downloads"),
            skip_copy_image: false,
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout, body included.
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0"
                .to_string(),
            connect_timeout_secs: 10,
            timeout_secs: 60,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(StoreConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<StoreConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: StoreConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a `store.toml` path, falling back to stock defaults.
pub fn load_config(path: &Path) -> Result<StoreConfig, ConfigError> {
    let base = stock_defaults_value();
    let overlay = load_raw_config(path)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `store.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Gallery Store Configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Transient tier: size-bounded disk cache shared by all galleries
# ---------------------------------------------------------------------------
[cache]
directory = ".gallery-store/cache"

# Size bound in MiB. Least recently used pages are evicted beyond it.
# Clamped to the range 160..=5120.
max_size_mb = 320

# ---------------------------------------------------------------------------
# Persistent tier: per-gallery download directories
# ---------------------------------------------------------------------------
[download]
location = "downloads"

# When a page is already cached, copy only GIFs into the download directory
# and fetch everything else again.
skip_copy_image = false

# ---------------------------------------------------------------------------
# HTTP
# ---------------------------------------------------------------------------
[http]
user_agent = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0"
connect_timeout_secs = 10
timeout_secs = 60
"##
}

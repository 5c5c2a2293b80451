//! Runtime configuration: an optional TOML file, then CLI overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheLimits;
use crate::error::{CoreError, Result};
use crate::scanner::ScanOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the indexed media tree.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    #[serde(default = "crate::db::default_db_path")]
    pub db_path: PathBuf,

    /// Seconds between background scans; 0 disables the interval.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Rescan on filesystem change events.
    #[serde(default = "default_true")]
    pub watch: bool,

    #[serde(default)]
    pub follow_links: bool,

    #[serde(default)]
    pub index_hidden: bool,

    #[serde(default)]
    pub index_non_media: bool,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Longest thumbnail edge in pixels.
    #[serde(default = "default_thumb_size")]
    pub thumb_size: u32,

    #[serde(default = "default_ffmpeg_timeout")]
    pub ffmpeg_timeout_secs: u64,
}

fn default_media_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_scan_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    2048
}

fn default_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_thumb_size() -> u32 {
    256
}

fn default_ffmpeg_timeout() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            thumb_size: default_thumb_size(),
            ffmpeg_timeout_secs: default_ffmpeg_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_dir: default_media_dir(),
            db_path: crate::db::default_db_path(),
            scan_interval_secs: default_scan_interval(),
            watch: true,
            follow_links: false,
            index_hidden: false,
            index_non_media: false,
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan_interval_secs > 0).then(|| Duration::from_secs(self.scan_interval_secs))
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            follow_links: self.follow_links,
            index_hidden: self.index_hidden,
            index_non_media: self.index_non_media,
        }
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.cache.max_entries,
            max_bytes: self.cache.max_bytes,
        }
    }

    pub fn ffmpeg_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.ffmpeg_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c = Config::parse("").unwrap();
        assert_eq!(c.scan_interval_secs, 300);
        assert!(c.watch);
        assert!(!c.index_hidden);
        assert_eq!(c.cache.max_entries, 2048);
        assert_eq!(c.cache.max_bytes, 64 * 1024 * 1024);
        assert_eq!(c.cache.thumb_size, 256);
        assert_eq!(c.scan_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn partial_cache_table() {
        let c = Config::parse(
            r#"
            media_dir = "/srv/media"
            scan_interval_secs = 0
            index_non_media = true

            [cache]
            max_entries = 16
            "#,
        )
        .unwrap();
        assert_eq!(c.media_dir, PathBuf::from("/srv/media"));
        assert_eq!(c.scan_interval(), None);
        assert!(c.scan_options().index_non_media);
        assert_eq!(c.cache_limits().max_entries, 16);
        assert_eq!(c.cache_limits().max_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = Config::parse("scan_interval_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)), "{err}");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lv-media.toml");
        std::fs::write(&path, "watch = false\n").unwrap();
        assert!(!Config::load(&path).unwrap().watch);
        assert!(Config::load(&dir.path().join("nope.toml")).is_err());
    }
}

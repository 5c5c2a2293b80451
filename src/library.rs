//! One handle owning the index, scanner, artifact cache and streaming
//! engine for a media root. Constructed once and passed to whatever routes
//! requests; nothing here is process-global.

use http::{HeaderMap, Method, Response};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{ArtifactCache, ArtifactKind, CacheOccupancy, Deriver, Payload};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::index::{FileEntry, Index, ListQuery};
use crate::scanner::{ScanOutcome, Scanner};
use crate::stats::Stats;
use crate::stream::{StreamBody, StreamEngine};
use crate::thumbs::ThumbnailDeriver;
use crate::watcher::{ScanScheduler, SchedulerConfig};

/// Decode and validate a path taken from a request URL. `..`, empty,
/// `.` and drive-qualified components are refused as not found.
pub fn request_path(raw: &str) -> Result<String> {
    let not_found = || CoreError::NotFound(raw.to_string());
    let decoded = urlencoding::decode(raw).map_err(|_| not_found())?;
    let bad = |part: &str| {
        part.is_empty() || part == "." || part == ".." || part.contains(['\0', ':'])
    };
    if decoded.split(['/', '\\']).any(bad) {
        return Err(not_found());
    }
    Ok(decoded.replace('\\', "/"))
}

/// Outcome of one item in a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkResult {
    pub path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkResult {
    fn from_result(path: &str, r: Result<()>) -> Self {
        Self {
            path: path.to_string(),
            ok: r.is_ok(),
            error: r.err().map(|e| e.to_string()),
        }
    }
}

pub struct Library {
    config: Config,
    index: Index,
    scanner: Arc<Scanner>,
    cache: ArtifactCache,
    stream: StreamEngine,
}

impl Library {
    /// Open the index at `config.db_path` and wire the default deriver.
    pub fn open(config: Config) -> Result<Self> {
        let index = Index::open(&config.db_path)?;
        let deriver = Arc::new(ThumbnailDeriver {
            max_size: config.cache.thumb_size,
            ffmpeg_timeout: config.ffmpeg_timeout(),
        });
        Ok(Self::with_parts(config, index, deriver))
    }

    pub fn with_parts(config: Config, index: Index, deriver: Arc<dyn Deriver>) -> Self {
        let root = config.media_dir.clone();
        let scanner = Arc::new(Scanner::new(index.clone(), &root, config.scan_options()));
        let cache = ArtifactCache::new(&root, config.cache_limits(), deriver);
        let stream = StreamEngine::new(&root);
        Self {
            config,
            index,
            scanner,
            cache,
            stream,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.media_dir
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Run one pass on the calling thread; coalesces with a running pass.
    pub fn scan(&self) -> ScanOutcome {
        self.scanner.scan()
    }

    /// Startup scan plus interval and fs-event triggers, per config.
    pub fn start_scheduler(&self) -> Result<ScanScheduler> {
        let db = &self.config.db_path;
        let ignore = vec![db.canonicalize().unwrap_or_else(|_| db.clone()), db.clone()];
        ScanScheduler::start(
            self.scanner.clone(),
            SchedulerConfig {
                interval: self.config.scan_interval(),
                watch: self.config.watch,
                ignore,
                index_hidden: self.config.index_hidden,
                ..Default::default()
            },
        )
    }

    pub fn stats(&self) -> Result<Stats> {
        self.index.stats()
    }

    /// Look up an entry by (still percent-encoded) request path.
    pub fn entry(&self, raw_path: &str) -> Result<FileEntry> {
        self.index.get(&request_path(raw_path)?)
    }

    /// List a folder named by a request path. `""` (or `/`) is the media
    /// root; a trailing slash is accepted.
    pub fn list(&self, query: &ListQuery) -> Result<Vec<FileEntry>> {
        let raw = query.folder.trim_end_matches('/');
        let folder = if raw.is_empty() {
            String::new()
        } else {
            request_path(raw)?
        };
        self.index.list(&ListQuery {
            folder,
            ..query.clone()
        })
    }

    /// Cached or freshly derived artifact for an indexed file. Unknown paths
    /// fail before the cache is consulted.
    pub async fn artifact(&self, raw_path: &str, kind: ArtifactKind) -> Result<Payload> {
        let entry = self.entry(raw_path)?;
        if entry.is_folder() {
            return Err(CoreError::IsFolder(entry.path));
        }
        Ok(self.cache.get(&entry, kind).await?)
    }

    pub async fn thumbnail(&self, raw_path: &str) -> Result<Payload> {
        self.artifact(raw_path, ArtifactKind::Thumbnail).await
    }

    pub async fn stream(
        &self,
        raw_path: &str,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<Response<StreamBody>> {
        let entry = self.entry(raw_path)?;
        self.stream.serve(&entry, method, headers).await
    }

    pub fn cache_occupancy(&self) -> CacheOccupancy {
        self.cache.occupancy()
    }

    pub fn invalidate(&self, raw_path: &str) -> Result<usize> {
        Ok(self.cache.invalidate(&request_path(raw_path)?))
    }

    pub fn bulk_favorite(&self, paths: &[String], favorite: bool) -> Vec<BulkResult> {
        paths
            .iter()
            .map(|p| {
                let r = request_path(p).and_then(|p| self.index.set_favorite(&p, favorite));
                BulkResult::from_result(p, r)
            })
            .collect()
    }

    /// Add (`add = true`) or remove a tag across many paths.
    pub fn bulk_tag(&self, paths: &[String], tag: &str, add: bool) -> Vec<BulkResult> {
        debug!("bulk tag {:?} on {} paths (add={})", tag, paths.len(), add);
        paths
            .iter()
            .map(|p| {
                let r = request_path(p).and_then(|p| {
                    if add {
                        self.index.add_tag(&p, tag)
                    } else {
                        self.index.remove_tag(&p, tag)
                    }
                });
                BulkResult::from_result(p, r)
            })
            .collect()
    }
}

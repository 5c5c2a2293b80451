//! Directory scanner: reconcile the index with what is on disk.
//!
//! One pass walks the media root, upserts every observed folder and file,
//! then removes indexed paths that were not observed. Subtrees that could
//! not be read are excluded from removal so a transient permission error
//! never wipes part of the index.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::classify::{self, FileType};
use crate::index::{Index, Observed, Upsert};

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub follow_links: bool,
    pub index_hidden: bool,
    pub index_non_media: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub visited: usize,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Paths that could not be read (permissions, vanished mid-walk).
    pub skipped: usize,
    pub storage_failures: usize,
    pub failed_dirs: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u128,
}

impl ScanReport {
    /// Number of index writes this pass performed.
    pub fn mutations(&self) -> usize {
        self.inserted + self.updated + self.removed
    }
}

#[derive(Debug)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// Another pass was already running; this request was dropped.
    Coalesced,
}

pub struct Scanner {
    index: Index,
    root: PathBuf,
    opts: ScanOptions,
    running: AtomicBool,
    cancel: AtomicBool,
}

/// Clears the running flag however the pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scanner {
    pub fn new(index: Index, root: impl Into<PathBuf>, opts: ScanOptions) -> Self {
        Self {
            index,
            root: root.into(),
            opts,
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the current pass (or the next one, if none is running) at the
    /// next entry boundary. A cancelled pass removes nothing.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Withdraw a cancel request no pass has picked up yet.
    pub(crate) fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub fn scan(&self) -> ScanOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("scan already in progress, request coalesced");
            return ScanOutcome::Coalesced;
        }
        let _guard = RunningGuard(&self.running);
        let report = self.pass();
        self.clear_cancel();
        ScanOutcome::Completed(report)
    }

    fn pass(&self) -> ScanReport {
        let started = Instant::now();
        let mut report = ScanReport::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut failed: Vec<String> = Vec::new();
        debug!("scan root: {}", self.root.display());

        let mut walker = WalkDir::new(&self.root)
            .follow_links(self.opts.follow_links)
            .into_iter();

        loop {
            let entry = match walker.next() {
                None => break,
                Some(Ok(e)) => e,
                Some(Err(err)) => {
                    let rel = err.path().and_then(|p| rel_path(&self.root, p));
                    warn!("scan: skipping unreadable path: {}", err);
                    report.skipped += 1;
                    if let Some(rel) = rel {
                        failed.push(rel);
                    }
                    continue;
                }
            };

            if self.cancel.load(Ordering::Acquire) {
                info!("scan cancelled after {} entries", report.visited);
                report.cancelled = true;
                break;
            }

            if entry.depth() == 0 {
                continue;
            }

            let is_dir = entry.file_type().is_dir();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden && !self.opts.index_hidden {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            let Some(rel) = rel_path(&self.root, entry.path()) else {
                warn!("scan: skipping non-UTF-8 path {}", entry.path().display());
                report.skipped += 1;
                continue;
            };

            let file_type = if is_dir {
                FileType::Folder
            } else if entry.file_type().is_file() {
                classify::classify_path(entry.path()).0
            } else {
                // Unfollowed symlinks, sockets, devices.
                continue;
            };
            if file_type == FileType::Other && !self.opts.index_non_media {
                continue;
            }

            // Seen on disk: never tombstone it this pass, even if the
            // metadata read or the index write below fails.
            visited.insert(rel.clone());

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("scan: cannot stat {}: {}", rel, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let observed = Observed {
                size: (!is_dir).then(|| meta.len()),
                modified_ms: mtime_ms(&meta),
                path: rel,
                file_type,
            };

            report.visited += 1;
            match self.index.upsert(&observed) {
                Ok(Upsert::Inserted) => report.inserted += 1,
                Ok(Upsert::Updated) => report.updated += 1,
                Ok(Upsert::Unchanged) => {}
                Err(e) => {
                    warn!("scan: index write failed for {}: {}", observed.path, e);
                    report.storage_failures += 1;
                }
            }
        }

        if !report.cancelled {
            self.tombstone(&visited, &failed, &mut report);
        }

        report.failed_dirs = failed;
        report.elapsed_ms = started.elapsed().as_millis();
        info!(
            "scan done: {} visited, +{} ~{} -{}, {} skipped, {} storage failures ({} ms)",
            report.visited,
            report.inserted,
            report.updated,
            report.removed,
            report.skipped,
            report.storage_failures,
            report.elapsed_ms
        );
        report
    }

    fn tombstone(&self, visited: &HashSet<String>, failed: &[String], report: &mut ScanReport) {
        let known = match self.index.paths_under("") {
            Ok(paths) => paths,
            Err(e) => {
                warn!("scan: cannot list indexed paths, skipping prune: {}", e);
                report.storage_failures += 1;
                return;
            }
        };
        for path in known {
            if visited.contains(&path) || failed.iter().any(|dir| is_under(&path, dir)) {
                continue;
            }
            match self.index.remove(&path) {
                Ok(n) => report.removed += n,
                Err(e) => {
                    warn!("scan: prune failed for {}: {}", path, e);
                    report.storage_failures += 1;
                }
            }
        }
    }
}

/// `/`-joined path relative to `root`; `""` for the root itself.
fn rel_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for c in rel.components() {
        parts.push(c.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

fn is_under(path: &str, dir: &str) -> bool {
    dir.is_empty()
        || path == dir
        || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

pub(crate) fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ListQuery;
    use std::fs;

    fn completed(outcome: ScanOutcome) -> ScanReport {
        match outcome {
            ScanOutcome::Completed(r) => r,
            ScanOutcome::Coalesced => panic!("scan unexpectedly coalesced"),
        }
    }

    fn setup() -> (tempfile::TempDir, Index, Scanner) {
        let dir = tempfile::tempdir().unwrap();
        let idx = Index::open_memory().unwrap();
        let scanner = Scanner::new(idx.clone(), dir.path(), ScanOptions::default());
        (dir, idx, scanner)
    }

    #[test]
    fn rel_path_and_is_under() {
        let root = Path::new("/media");
        assert_eq!(rel_path(root, Path::new("/media")).as_deref(), Some(""));
        assert_eq!(
            rel_path(root, Path::new("/media/a/b.jpg")).as_deref(),
            Some("a/b.jpg")
        );
        assert_eq!(rel_path(root, Path::new("/other/x")), None);
        assert!(is_under("a/b", "a"));
        assert!(is_under("a", "a"));
        assert!(is_under("anything", ""));
        assert!(!is_under("ab/c", "a"));
    }

    #[test]
    fn scan_adds_files_and_folders() {
        let (dir, idx, scanner) = setup();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.jpg"), b"img").unwrap();
        fs::write(dir.path().join("sub/b.mp4"), b"video").unwrap();
        fs::write(dir.path().join("sub/list.m3u"), b"#EXTM3U").unwrap();
        fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        fs::write(dir.path().join(".hidden.jpg"), b"img").unwrap();

        let r = completed(scanner.scan());
        assert_eq!(r.inserted, 4, "{r:?}");
        assert_eq!(r.removed, 0);

        let root: Vec<String> = idx
            .list(&ListQuery::folder(""))
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(root, vec!["a.jpg", "sub"]);
        let b = idx.get("sub/b.mp4").unwrap();
        assert_eq!(b.file_type, FileType::Video);
        assert_eq!(b.size, Some(5));
        assert_eq!(idx.get("sub").unwrap().file_type, FileType::Folder);
    }

    #[test]
    fn optional_hidden_and_non_media() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join(".cache/x.jpg"), b"img").unwrap();
        let idx = Index::open_memory().unwrap();
        let opts = ScanOptions {
            index_hidden: true,
            index_non_media: true,
            ..Default::default()
        };
        let scanner = Scanner::new(idx.clone(), dir.path(), opts);
        completed(scanner.scan());
        assert_eq!(idx.get("notes.txt").unwrap().file_type, FileType::Other);
        assert!(idx.get(".cache/x.jpg").is_ok());
    }

    #[test]
    fn second_scan_is_a_no_op() {
        let (dir, idx, scanner) = setup();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/a.png"), b"png").unwrap();
        fs::write(dir.path().join("x/b.gif"), b"gif").unwrap();

        let first = completed(scanner.scan());
        assert_eq!(first.mutations(), 4);
        let mut q = ListQuery::folder("");
        q.recursive = true;
        let before = idx.list(&q).unwrap();

        let second = completed(scanner.scan());
        assert_eq!(second.mutations(), 0, "{second:?}");
        assert_eq!(second.visited, 4);
        assert_eq!(idx.list(&q).unwrap(), before);
    }

    #[test]
    fn deletion_propagates_and_drops_tags() {
        let (dir, idx, scanner) = setup();
        fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        fs::write(dir.path().join("b.jpg"), b"b").unwrap();
        completed(scanner.scan());

        idx.add_tag("a.jpg", "doomed").unwrap();
        idx.add_tag("b.jpg", "keeper").unwrap();
        idx.set_favorite("a.jpg", true).unwrap();

        fs::remove_file(dir.path().join("a.jpg")).unwrap();
        let r = completed(scanner.scan());
        assert_eq!(r.removed, 1);

        assert!(idx.get("a.jpg").unwrap_err().is_not_found());
        let tags = idx.tags().unwrap();
        let keeper = tags.iter().find(|t| t.name == "keeper").unwrap();
        assert_eq!(keeper.count, 1);
        let doomed = tags.iter().find(|t| t.name == "doomed").unwrap();
        assert_eq!(doomed.count, 0);
        assert_eq!(idx.stats().unwrap().total_favorites, 0);
    }

    #[test]
    fn removed_folder_prunes_subtree() {
        let (dir, idx, scanner) = setup();
        fs::create_dir_all(dir.path().join("gone/deeper")).unwrap();
        fs::write(dir.path().join("gone/deeper/a.jpg"), b"a").unwrap();
        fs::write(dir.path().join("stay.jpg"), b"s").unwrap();
        completed(scanner.scan());
        assert_eq!(idx.paths_under("").unwrap().len(), 4);

        fs::remove_dir_all(dir.path().join("gone")).unwrap();
        let r = completed(scanner.scan());
        assert_eq!(r.removed, 3);
        assert_eq!(idx.paths_under("").unwrap(), vec!["stay.jpg"]);
    }

    #[test]
    fn changed_file_is_updated_and_tags_survive() {
        let (dir, idx, scanner) = setup();
        fs::write(dir.path().join("a.jpg"), b"small").unwrap();
        completed(scanner.scan());
        idx.add_tag("a.jpg", "kept").unwrap();

        fs::write(dir.path().join("a.jpg"), b"much larger content here").unwrap();
        let r = completed(scanner.scan());
        assert_eq!(r.updated, 1);
        let e = idx.get("a.jpg").unwrap();
        assert_eq!(e.size, Some(24));
        assert_eq!(e.tags, vec!["kept"]);
    }

    #[test]
    fn concurrent_request_is_coalesced() {
        let (_dir, _idx, scanner) = setup();
        scanner.running.store(true, Ordering::Release);
        assert!(matches!(scanner.scan(), ScanOutcome::Coalesced));
        scanner.running.store(false, Ordering::Release);
        assert!(matches!(scanner.scan(), ScanOutcome::Completed(_)));
        assert!(!scanner.is_running());
    }

    #[test]
    fn cancelled_pass_removes_nothing() {
        let (dir, idx, scanner) = setup();
        fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        completed(scanner.scan());
        fs::remove_file(dir.path().join("a.jpg")).unwrap();

        scanner.cancel();
        let r = completed(scanner.scan());
        assert!(r.cancelled);
        assert_eq!(r.removed, 0);
        assert!(idx.get("a.jpg").is_ok());

        // The flag is consumed; the next pass prunes normally.
        let r = completed(scanner.scan());
        assert_eq!(r.removed, 1);
    }

    #[test]
    fn storage_failure_skips_the_entry_not_the_pass() {
        let (dir, idx, scanner) = setup();
        fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        completed(scanner.scan());

        fs::write(dir.path().join("b.jpg"), b"b").unwrap();
        fs::write(dir.path().join("c.jpg"), b"c").unwrap();
        idx.conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_b BEFORE INSERT ON files WHEN NEW.path = 'b.jpg'
                 BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
            )
            .unwrap();

        let r = completed(scanner.scan());
        assert_eq!(r.storage_failures, 1, "{r:?}");
        assert_eq!(r.inserted, 1);
        assert_eq!(r.removed, 0);
        assert!(!r.cancelled);
        assert!(idx.get("a.jpg").is_ok());
        assert!(idx.get("c.jpg").is_ok());
        assert!(idx.get("b.jpg").unwrap_err().is_not_found());

        idx.conn().unwrap().execute_batch("DROP TRIGGER block_b;").unwrap();
        let r = completed(scanner.scan());
        assert_eq!(r.storage_failures, 0);
        assert_eq!(r.inserted, 1);
        assert!(idx.get("b.jpg").is_ok());
    }

    #[test]
    fn missing_root_does_not_wipe_index() {
        let (dir, idx, scanner) = setup();
        fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        completed(scanner.scan());

        let gone = dir.path().to_path_buf();
        drop(dir);
        assert!(!gone.exists());
        let r = completed(scanner.scan());
        assert_eq!(r.removed, 0);
        assert!(r.skipped >= 1);
        assert!(idx.get("a.jpg").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_dir_is_skipped_not_pruned() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, idx, scanner) = setup();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("a.jpg"), b"a").unwrap();
        fs::write(dir.path().join("open.jpg"), b"o").unwrap();
        completed(scanner.scan());
        assert!(idx.get("locked/a.jpg").is_ok());

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Running with privileges that ignore permission bits.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let r = completed(scanner.scan());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(r.skipped, 1);
        assert_eq!(r.failed_dirs, vec!["locked"]);
        assert_eq!(r.removed, 0);
        assert!(idx.get("locked/a.jpg").is_ok());
        assert!(idx.get("open.jpg").is_ok());
    }
}

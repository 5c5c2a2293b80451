//! Scan scheduling: startup pass, recurring interval, filesystem events.
//!
//! A background thread owns the trigger loop. Triggers (interval expiry,
//! `notify` events under the media root, explicit requests) collapse into
//! at most one pending pass; the scanner's own running flag coalesces with
//! passes started elsewhere.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::scanner::{ScanOutcome, Scanner};

/// How often the loop wakes to check the quit flag and deadlines.
const TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `None` disables interval scans.
    pub interval: Option<Duration>,
    /// Rescan on filesystem events under the root.
    pub watch: bool,
    /// Quiet period after the last fs event before rescanning.
    pub debounce: Duration,
    /// Event paths starting with any of these are ignored (the index
    /// database and its journal files, when they live under the root).
    pub ignore: Vec<PathBuf>,
    pub index_hidden: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(300)),
            watch: true,
            debounce: Duration::from_millis(500),
            ignore: Vec::new(),
            index_hidden: false,
        }
    }
}

enum Trigger {
    Request,
    FsEvent,
    Quit,
}

/// Handle to the running scheduler. Drop to stop.
pub struct ScanScheduler {
    scanner: Arc<Scanner>,
    quit: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    tx: mpsc::Sender<Trigger>,
    thread: Option<std::thread::JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl ScanScheduler {
    /// Spawn the scheduler thread. The first pass starts immediately.
    pub fn start(scanner: Arc<Scanner>, cfg: SchedulerConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let quit = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU64::new(0));

        let watcher = if cfg.watch {
            watch_root(scanner.root(), &cfg, tx.clone())
        } else {
            None
        };

        let thread = {
            let scanner = scanner.clone();
            let quit = quit.clone();
            let completed = completed.clone();
            let cfg = cfg.clone();
            std::thread::Builder::new()
                .name("scan-scheduler".into())
                .spawn(move || run(&scanner, &cfg, &rx, &quit, &completed))?
        };

        Ok(Self {
            scanner,
            quit,
            completed,
            tx,
            thread: Some(thread),
            _watcher: watcher,
        })
    }

    /// Ask for a pass as soon as possible. Cheap; repeated requests
    /// collapse into one.
    pub fn request_scan(&self) {
        self.tx.send(Trigger::Request).ok();
    }

    /// Passes that ran to completion (coalesced requests excluded).
    pub fn scans_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        self.tx.send(Trigger::Quit).ok();
        if self.scanner.is_running() {
            self.scanner.cancel();
        }
        if let Some(t) = self.thread.take() {
            t.join().ok();
        }
        // The pass may have ended between the check and the cancel.
        self.scanner.clear_cancel();
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_root(
    root: &Path,
    cfg: &SchedulerConfig,
    tx: mpsc::Sender<Trigger>,
) -> Option<RecommendedWatcher> {
    let filter_root = root.to_path_buf();
    let filter = cfg.clone();
    let handler = move |res: notify::Result<notify::Event>| match res {
        Ok(event) if relevant(&filter_root, &filter, &event) => {
            tx.send(Trigger::FsEvent).ok();
        }
        Ok(_) => {}
        Err(e) => debug!("watcher: {}", e),
    };
    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(w) => w,
        Err(e) => {
            warn!("watcher: failed to create: {}", e);
            return None;
        }
    };
    match watcher.watch(root, RecursiveMode::Recursive) {
        Ok(()) => {
            info!("watching {}", root.display());
            Some(watcher)
        }
        Err(e) => {
            warn!("watcher: failed to watch {}: {}", root.display(), e);
            None
        }
    }
}

/// Whether an fs event can change what the scanner would index.
fn relevant(root: &Path, cfg: &SchedulerConfig, event: &notify::Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| {
        let raw = p.to_string_lossy();
        if cfg
            .ignore
            .iter()
            .any(|ig| raw.starts_with(ig.to_string_lossy().as_ref()))
        {
            return false;
        }
        if cfg.index_hidden {
            return true;
        }
        let rel = p.strip_prefix(root).unwrap_or(p);
        !rel.components().any(|c| match c {
            Component::Normal(s) => s.to_string_lossy().starts_with('.'),
            _ => false,
        })
    })
}

fn run(
    scanner: &Scanner,
    cfg: &SchedulerConfig,
    rx: &mpsc::Receiver<Trigger>,
    quit: &AtomicBool,
    completed: &AtomicU64,
) {
    let mut pending = true;
    let mut last_event: Option<Instant> = None;
    let mut next_due = cfg.interval.map(|i| Instant::now() + i);

    while !quit.load(Ordering::Acquire) {
        let debounced = last_event.is_some_and(|t| t.elapsed() >= cfg.debounce);
        let due = next_due.is_some_and(|t| Instant::now() >= t);
        if pending || debounced || due {
            match scanner.scan() {
                ScanOutcome::Completed(report) => {
                    completed.fetch_add(1, Ordering::AcqRel);
                    if report.cancelled {
                        debug!("scheduler: pass cancelled");
                    }
                }
                ScanOutcome::Coalesced => debug!("scheduler: pass already running"),
            }
            pending = false;
            last_event = None;
            next_due = cfg.interval.map(|i| Instant::now() + i);
            continue;
        }

        match rx.recv_timeout(TICK) {
            Ok(Trigger::Request) => pending = true,
            Ok(Trigger::FsEvent) => last_event = Some(Instant::now()),
            Ok(Trigger::Quit) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("scheduler: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::scanner::ScanOptions;

    fn wait_for(mut cond: impl FnMut() -> bool, secs: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(secs);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        cond()
    }

    fn setup() -> (tempfile::TempDir, Index, Arc<Scanner>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        let idx = Index::open_memory().unwrap();
        let scanner = Arc::new(Scanner::new(idx.clone(), dir.path(), ScanOptions::default()));
        (dir, idx, scanner)
    }

    fn quiet() -> SchedulerConfig {
        SchedulerConfig {
            interval: None,
            watch: false,
            debounce: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn event(kind: EventKind, path: &Path) -> notify::Event {
        notify::Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn startup_pass_runs_once() {
        let (_dir, idx, scanner) = setup();
        let sched = ScanScheduler::start(scanner, quiet()).unwrap();
        assert!(wait_for(|| sched.scans_completed() == 1, 5));
        assert!(idx.get("a.jpg").is_ok());
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(sched.scans_completed(), 1);
    }

    #[test]
    fn requests_trigger_a_pass() {
        let (dir, idx, scanner) = setup();
        let sched = ScanScheduler::start(scanner, quiet()).unwrap();
        assert!(wait_for(|| sched.scans_completed() == 1, 5));

        std::fs::write(dir.path().join("b.png"), b"y").unwrap();
        sched.request_scan();
        sched.request_scan();
        assert!(wait_for(|| idx.get("b.png").is_ok(), 5));
    }

    #[test]
    fn interval_repeats() {
        let (_dir, _idx, scanner) = setup();
        let cfg = SchedulerConfig {
            interval: Some(Duration::from_millis(100)),
            ..quiet()
        };
        let sched = ScanScheduler::start(scanner, cfg).unwrap();
        assert!(wait_for(|| sched.scans_completed() >= 3, 5));
    }

    #[test]
    fn fs_events_trigger_rescan() {
        let (dir, idx, scanner) = setup();
        let cfg = SchedulerConfig { watch: true, ..quiet() };
        let sched = ScanScheduler::start(scanner, cfg).unwrap();
        assert!(wait_for(|| sched.scans_completed() == 1, 5));

        std::fs::create_dir(dir.path().join("new")).unwrap();
        std::fs::write(dir.path().join("new/c.mp4"), b"z").unwrap();
        assert!(
            wait_for(|| idx.get("new/c.mp4").is_ok(), 5),
            "watcher should pick up the new file"
        );
        std::fs::remove_file(dir.path().join("a.jpg")).unwrap();
        assert!(wait_for(|| idx.get("a.jpg").is_err(), 5));
    }

    #[test]
    fn stop_and_drop_are_clean() {
        let (_dir, _idx, scanner) = setup();
        let mut sched = ScanScheduler::start(scanner.clone(), quiet()).unwrap();
        sched.stop();
        sched.stop();
        assert!(!scanner.is_running());

        let sched = ScanScheduler::start(scanner, SchedulerConfig::default()).unwrap();
        drop(sched);
    }

    #[test]
    fn stop_leaves_no_cancel_behind() {
        let (dir, idx, scanner) = setup();
        let mut sched = ScanScheduler::start(scanner.clone(), quiet()).unwrap();
        assert!(wait_for(|| sched.scans_completed() == 1, 5));

        // A cancel that lands just after the scheduler's pass finished.
        scanner.cancel();
        sched.stop();

        std::fs::write(dir.path().join("later.png"), b"y").unwrap();
        let ScanOutcome::Completed(report) = scanner.scan() else {
            panic!("scanner idle after stop");
        };
        assert!(!report.cancelled);
        assert!(idx.get("later.png").is_ok());
    }

    #[test]
    fn relevance_filter() {
        let root = Path::new("/media");
        let mut cfg = quiet();
        cfg.ignore = vec![PathBuf::from("/media/lv.db")];
        let create = EventKind::Create(notify::event::CreateKind::File);

        assert!(relevant(root, &cfg, &event(create, Path::new("/media/a/b.jpg"))));
        assert!(!relevant(
            root,
            &cfg,
            &event(EventKind::Access(notify::event::AccessKind::Any), Path::new("/media/b.jpg"))
        ));
        assert!(!relevant(root, &cfg, &event(create, Path::new("/media/lv.db-wal"))));
        assert!(!relevant(root, &cfg, &event(create, Path::new("/media/.cache/x.jpg"))));

        cfg.index_hidden = true;
        assert!(relevant(root, &cfg, &event(create, Path::new("/media/.cache/x.jpg"))));
    }
}

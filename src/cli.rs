//! CLI subcommand implementations.

use anyhow::{bail, Context};
use http::{HeaderMap, HeaderValue, Method};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use lv_media::cache::ArtifactKind;
use lv_media::index::{FileEntry, ListQuery};
use lv_media::scanner::ScanOutcome;
use lv_media::Library;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn size_str(entry: &FileEntry) -> String {
    match entry.size {
        None => "-".into(),
        Some(n) if n >= 1 << 30 => format!("{:.1}G", n as f64 / (1u64 << 30) as f64),
        Some(n) if n >= 1 << 20 => format!("{:.1}M", n as f64 / (1u64 << 20) as f64),
        Some(n) if n >= 1 << 10 => format!("{:.1}K", n as f64 / 1024.0),
        Some(n) => n.to_string(),
    }
}

fn entry_line(e: &FileEntry) -> String {
    let fav = if e.favorite { "*" } else { " " };
    let tags = if e.tags.is_empty() {
        String::new()
    } else {
        format!("  [{}]", e.tags.join(", "))
    };
    format!("{fav} {:<8} {:>8}  {}{}", e.file_type, size_str(e), e.path, tags)
}

pub fn scan(lib: &Library) -> anyhow::Result<()> {
    println!("Scanning {}...", lib.root().display());
    match lib.scan() {
        ScanOutcome::Completed(r) => {
            println!(
                "Done. {} visited, {} added, {} updated, {} removed in {}ms.",
                r.visited, r.inserted, r.updated, r.removed, r.elapsed_ms
            );
            if r.skipped > 0 {
                println!("  {} unreadable paths skipped", r.skipped);
            }
            for d in &r.failed_dirs {
                println!("  kept (unreadable): {d}");
            }
        }
        ScanOutcome::Coalesced => println!("A scan is already running."),
    }
    Ok(())
}

/// Startup scan, then interval and fs-event rescans until killed.
pub fn watch(lib: &Library) -> anyhow::Result<()> {
    let sched = lib.start_scheduler().context("starting scan scheduler")?;
    println!("Watching {} (Ctrl-C to stop)", lib.root().display());
    loop {
        std::thread::sleep(Duration::from_secs(60));
        debug!(
            "scheduler: {} passes, cache {:?}",
            sched.scans_completed(),
            lib.cache_occupancy()
        );
    }
}

pub fn ls(lib: &Library, query: &ListQuery, json: bool) -> anyhow::Result<()> {
    let entries = lib.list(query)?;
    if json {
        return print_json(&entries);
    }
    for e in &entries {
        println!("{}", entry_line(e));
    }
    Ok(())
}

pub fn show(lib: &Library, path: &str, json: bool) -> anyhow::Result<()> {
    let e = lib.entry(path)?;
    if json {
        return print_json(&e);
    }
    println!("path:     {}", e.path);
    println!("type:     {} ({})", e.file_type, e.mime());
    println!("size:     {}", size_str(&e));
    let modified = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(e.modified_ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| e.modified_ms.to_string());
    println!("modified: {modified}");
    println!("favorite: {}", e.favorite);
    println!("tags:     {}", e.tags.join(", "));
    Ok(())
}

pub fn random(lib: &Library, favorites_only: bool) -> anyhow::Result<()> {
    match lib.index().random_file(favorites_only)? {
        Some(e) => println!("{}", e.path),
        None => bail!("no matching files indexed"),
    }
    Ok(())
}

pub fn fav(lib: &Library, paths: &[String], off: bool, toggle: bool) -> anyhow::Result<()> {
    if toggle {
        for p in paths {
            let now = lib.index().toggle_favorite(&lv_media::library::request_path(p)?)?;
            println!("{} {}", if now { "+" } else { "-" }, p);
        }
        return Ok(());
    }
    report(&lib.bulk_favorite(paths, !off))
}

pub fn tag(lib: &Library, paths: &[String], tag: &str, add: bool) -> anyhow::Result<()> {
    report(&lib.bulk_tag(paths, tag, add))
}

fn report(results: &[lv_media::library::BulkResult]) -> anyhow::Result<()> {
    let mut failed = 0;
    for r in results {
        match &r.error {
            None => println!("ok    {}", r.path),
            Some(e) => {
                failed += 1;
                println!("fail  {}: {}", r.path, e);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} failed", results.len());
    }
    Ok(())
}

pub fn tag_delete(lib: &Library, tag: &str) -> anyhow::Result<()> {
    if lib.index().delete_tag(tag)? {
        println!("Deleted tag {tag}");
    } else {
        println!("No tag named {tag}");
    }
    Ok(())
}

pub fn tag_list(lib: &Library, json: bool) -> anyhow::Result<()> {
    let tags = lib.index().tags()?;
    if json {
        return print_json(&tags);
    }
    for t in &tags {
        println!("{:>6}  {}", t.count, t.name);
    }
    Ok(())
}

pub fn stats(lib: &Library, json: bool) -> anyhow::Result<()> {
    let s = lib.stats()?;
    if json {
        return print_json(&s);
    }
    println!("lv-media stats");
    println!("==============");
    println!("files:     {} ({} folders)", s.total_files, s.total_folders);
    println!("images:    {}", s.total_images);
    println!("videos:    {}", s.total_videos);
    println!("playlists: {}", s.total_playlists);
    println!("favorites: {}", s.total_favorites);
    println!("tags:      {}", s.total_tags);
    Ok(())
}

pub async fn thumb(lib: &Library, path: &str, kind: ArtifactKind, out: &Path) -> anyhow::Result<()> {
    let data = lib
        .artifact(path, kind)
        .await
        .with_context(|| format!("{} for {}", kind.as_str(), path))?;
    tokio::fs::write(out, data.as_slice())
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!("{} bytes -> {}", data.len(), out.display());
    Ok(())
}

/// Write the file (or a `bytes=` range of it) to stdout.
pub async fn cat(lib: &Library, path: &str, range: Option<&str>) -> anyhow::Result<()> {
    let mut headers = HeaderMap::new();
    if let Some(r) = range {
        let value = HeaderValue::from_str(&format!("bytes={r}")).context("invalid range")?;
        headers.insert(http::header::RANGE, value);
    }
    let resp = lib.stream(path, &Method::GET, &headers).await?;
    debug!("{} {:?}", resp.status(), resp.headers());
    if resp.status() == http::StatusCode::RANGE_NOT_SATISFIABLE {
        bail!("range not satisfiable ({path})");
    }
    let mut stdout = tokio::io::stdout();
    resp.into_body().copy_to(&mut stdout).await?;
    tokio::io::AsyncWriteExt::flush(&mut stdout).await?;
    Ok(())
}

//! Byte streaming with HTTP range and conditional semantics.
//!
//! The source file is opened read-only per request and owned by the
//! returned [`StreamBody`]; dropping the body (response finished, client
//! gone, handler error) closes it. Nothing here takes a file lock.
//!
//! Range handling:
//!   - no / malformed / non-`bytes` Range header → 200 with the full body
//!   - `bytes=a-b`, `bytes=a-`, `bytes=-n` → 206 with `Content-Range`
//!   - start at or past EOF, or `bytes=-0` → 416 with `bytes */total`
//!   - multiple ranges → only the first is served

use chrono::{DateTime, Utc};
use http::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
    IF_NONE_MATCH, IF_RANGE, LAST_MODIFIED, RANGE,
};
use http::{Method, Response, StatusCode};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, BufReader, ReadBuf, Take};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::index::FileEntry;
use crate::scanner::mtime_ms;

/// Read size used when pumping a body into a writer.
const CHUNK: usize = 256 * 1024;

// ── Body ────────────────────────────────────────────────────────────────

/// Response body: a bounded reader over the open source file, or nothing.
#[derive(Debug)]
pub struct StreamBody {
    reader: Option<Take<File>>,
    len: u64,
}

impl StreamBody {
    pub fn empty() -> Self {
        Self { reader: None, len: 0 }
    }

    fn file(file: File, len: u64) -> Self {
        use tokio::io::AsyncReadExt;
        Self {
            reader: Some(file.take(len)),
            len,
        }
    }

    /// Bytes this body will yield.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pump the whole body into `w` in large chunks.
    pub async fn copy_to<W: AsyncWrite + Unpin + ?Sized>(self, w: &mut W) -> io::Result<u64> {
        let mut reader = BufReader::with_capacity(CHUNK, self);
        tokio::io::copy_buf(&mut reader, w).await
    }
}

impl AsyncRead for StreamBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().reader.as_mut() {
            Some(r) => Pin::new(r).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ── Range parsing ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-`
    From(u64),
    /// `bytes=start-end`, inclusive
    FromTo(u64, u64),
    /// `bytes=-n`: the last n bytes
    Suffix(u64),
}

fn digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse the first range of a `Range` header. `None` means the header is
/// malformed or uses another unit and should be ignored.
pub fn parse_range(header: &str) -> Option<ByteRange> {
    let (unit, ranges) = header.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }
    let first = ranges.split(',').next()?.trim();
    let (start, end) = first.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    match (start.is_empty(), end.is_empty()) {
        (true, true) => None,
        (true, false) => Some(ByteRange::Suffix(digits(end)?)),
        (false, true) => Some(ByteRange::From(digits(start)?)),
        (false, false) => {
            let (s, e) = (digits(start)?, digits(end)?);
            (s <= e).then_some(ByteRange::FromTo(s, e))
        }
    }
}

/// Clamp a range against the resource length, giving inclusive `(start, end)`.
pub fn resolve_range(range: ByteRange, total: u64) -> Result<(u64, u64)> {
    let unsatisfiable = CoreError::Range(total);
    match range {
        ByteRange::From(s) if s < total => Ok((s, total - 1)),
        ByteRange::FromTo(s, e) if s < total => Ok((s, e.min(total - 1))),
        ByteRange::Suffix(n) if n > 0 && total > 0 => Ok((total - n.min(total), total - 1)),
        _ => Err(unsatisfiable),
    }
}

// ── Engine ──────────────────────────────────────────────────────────────

pub struct StreamEngine {
    root: PathBuf,
}

fn http_date(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn etag_matches(header: &str, etag: &str) -> bool {
    header.split(',').map(str::trim).any(|tag| {
        tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == etag
    })
}

fn set(headers: &mut HeaderMap, name: http::header::HeaderName, value: String) {
    if let Ok(v) = HeaderValue::try_from(value) {
        headers.insert(name, v);
    }
}

impl StreamEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Serve `entry` honoring `Range`, `If-Range` and `If-None-Match`.
    /// `HEAD` gets the same status and headers with an empty body.
    pub async fn serve(
        &self,
        entry: &FileEntry,
        method: &Method,
        req: &HeaderMap,
    ) -> Result<Response<StreamBody>> {
        if entry.is_folder() {
            return Err(CoreError::IsFolder(entry.path.clone()));
        }
        let mut file = match File::open(self.root.join(&entry.path)).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(entry.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Err(CoreError::IsFolder(entry.path.clone()));
        }
        let total = meta.len();
        let mtime = mtime_ms(&meta);
        let etag = format!("\"{mtime:x}-{total:x}\"");
        let last_modified = http_date(mtime);

        let mut resp = Response::new(StreamBody::empty());
        let h = resp.headers_mut();
        h.insert(CONTENT_TYPE, HeaderValue::from_static(entry.mime()));
        h.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        set(h, ETAG, etag.clone());
        if let Some(lm) = &last_modified {
            set(h, LAST_MODIFIED, lm.clone());
        }

        let header = move |name: http::header::HeaderName| {
            req.get(name).and_then(|v: &HeaderValue| v.to_str().ok())
        };

        if header(IF_NONE_MATCH).is_some_and(|inm| etag_matches(inm, &etag)) {
            *resp.status_mut() = StatusCode::NOT_MODIFIED;
            return Ok(resp);
        }

        let if_range_ok = match header(IF_RANGE) {
            None => true,
            Some(v) => v.trim() == etag || last_modified.as_deref() == Some(v.trim()),
        };
        let range = header(RANGE)
            .filter(|_| if_range_ok)
            .and_then(parse_range);

        let (status, start, len) = match range.map(|r| resolve_range(r, total)) {
            None => (StatusCode::OK, 0, total),
            Some(Ok((start, end))) => {
                set(
                    resp.headers_mut(),
                    CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                );
                (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
            }
            Some(Err(_)) => {
                debug!("416 for {} (total {})", entry.path, total);
                *resp.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                let h = resp.headers_mut();
                set(h, CONTENT_RANGE, format!("bytes */{total}"));
                h.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
                return Ok(resp);
            }
        };

        *resp.status_mut() = status;
        resp.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
        if *method == Method::HEAD {
            return Ok(resp);
        }
        if start > 0 {
            file.seek(io::SeekFrom::Start(start)).await?;
        }
        *resp.body_mut() = StreamBody::file(file, len);
        Ok(resp)
    }
}

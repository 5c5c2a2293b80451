use image::{DynamicImage, ImageFormat};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
#[cfg(unix)]
use wait_timeout::ChildExt;

use crate::cache::Deriver;
use crate::classify::FileType;
use crate::error::DerivationError;

const SHADOW_W: u32 = 6;
const SHADOW_H: u32 = 4;

/// Derives WebP thumbnails: images are decoded in-process, videos go through
/// an external ffmpeg keyframe grab.
pub struct ThumbnailDeriver {
    pub max_size: u32,
    pub ffmpeg_timeout: Duration,
}

impl Default for ThumbnailDeriver {
    fn default() -> Self {
        Self {
            max_size: 256,
            ffmpeg_timeout: Duration::from_secs(30),
        }
    }
}

impl Deriver for ThumbnailDeriver {
    fn derive(&self, source: &Path, file_type: FileType) -> Result<Vec<u8>, DerivationError> {
        match file_type {
            FileType::Image => image_thumb(source, self.max_size),
            FileType::Video => video_thumb(source, self.max_size, self.ffmpeg_timeout),
            other => Err(DerivationError::Unsupported(other)),
        }
    }

    fn shadow(&self, thumb: &[u8]) -> Result<Vec<u8>, DerivationError> {
        shadow(thumb)
    }
}

fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>, DerivationError> {
    // The WebP encoder only takes 8-bit RGB(A).
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut buf = Vec::new();
    rgba.write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::WebP)
        .map_err(|e| DerivationError::Encoder(e.to_string()))?;
    Ok(buf)
}

/// Fast integer-scaling thumbnail; much cheaper than Lanczos3 at this size.
/// Images already within bounds are re-encoded as-is.
fn image_thumb(path: &Path, max_size: u32) -> Result<Vec<u8>, DerivationError> {
    let img = image::open(path).map_err(|e| match e {
        image::ImageError::IoError(io) => DerivationError::Source(io.to_string()),
        other => DerivationError::Decode(other.to_string()),
    })?;
    if img.width() <= max_size && img.height() <= max_size {
        return encode_webp(&img);
    }
    encode_webp(&img.thumbnail(max_size, max_size))
}

/// Tiny 6x4 WebP from an already-encoded thumbnail.
fn shadow(thumb_webp: &[u8]) -> Result<Vec<u8>, DerivationError> {
    let img = image::load_from_memory(thumb_webp)
        .map_err(|e| DerivationError::Decode(format!("thumb for shadow: {e}")))?;
    let tiny = img.resize_exact(SHADOW_W, SHADOW_H, image::imageops::FilterType::Triangle);
    encode_webp(&tiny)
}

/// Run a child with a deadline, killing it on expiry.
fn run_with_timeout(
    mut child: std::process::Child,
    timeout: Duration,
) -> Result<std::process::Output, DerivationError> {
    use std::io::Read;

    // Drain stdout on a thread so a large frame cannot fill the pipe and
    // stall the child while we wait on it.
    let stdout = child.stdout.take();
    let reader = std::thread::spawn(move || {
        let mut out = Vec::new();
        if let Some(mut s) = stdout {
            s.read_to_end(&mut out).ok();
        }
        out
    });

    #[cfg(not(unix))]
    let wait_result: std::io::Result<Option<std::process::ExitStatus>> = {
        let _ = timeout;
        child.wait().map(Some)
    };
    #[cfg(unix)]
    let wait_result = child.wait_timeout(timeout);

    match wait_result {
        Ok(Some(status)) => {
            let mut stderr = Vec::new();
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr).ok();
            }
            let stdout = reader.join().unwrap_or_default();
            Ok(std::process::Output {
                status,
                stdout,
                stderr,
            })
        }
        Ok(None) => {
            child.kill().ok();
            child.wait().ok();
            Err(DerivationError::Timeout(timeout.as_secs()))
        }
        Err(e) => Err(DerivationError::Source(format!("wait failed: {e}"))),
    }
}

/// Probe duration with ffprobe, seek to ~30% (past intros and black frames),
/// grab one keyframe scaled to `max_size` wide and emit WebP on stdout.
fn video_thumb(path: &Path, max_size: u32, timeout: Duration) -> Result<Vec<u8>, DerivationError> {
    if !path.is_file() {
        return Err(DerivationError::Source(format!("{} is not a file", path.display())));
    }

    let duration = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()
        .and_then(|child| run_with_timeout(child, timeout).ok())
        .and_then(|out| String::from_utf8_lossy(&out.stdout).trim().parse::<f64>().ok())
        .unwrap_or(10.0);
    let seek_to = (duration * 0.3).max(0.0);
    debug!("video thumb: {} dur={:.1}s seek={:.1}s", path.display(), duration, seek_to);

    let child = Command::new("ffmpeg")
        .args(["-ss", &format!("{seek_to:.1}"), "-skip_frame", "nokey", "-i"])
        .arg(path)
        .args([
            "-vframes",
            "1",
            "-vf",
            &format!("scale={max_size}:-2"),
            "-c:v",
            "libwebp",
            "-quality",
            "50",
            "-f",
            "webp",
            "-y",
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DerivationError::Source(format!("ffmpeg failed to start: {e}")))?;

    let output = run_with_timeout(child, timeout)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DerivationError::Decode(format!(
            "ffmpeg: {}",
            stderr.lines().last().unwrap_or("unknown error")
        )));
    }
    if output.stdout.is_empty() {
        return Err(DerivationError::Decode("ffmpeg produced empty output".into()));
    }
    Ok(output.stdout)
}

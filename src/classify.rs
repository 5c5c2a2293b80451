//! Extension classifier: file extension → (file type, MIME type).
//!
//! Lookup walks the tables in a fixed order (images, videos, playlists) and
//! the first table containing the extension wins, so an extension listed in
//! more than one table always resolves the same way.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Folder,
    Image,
    Video,
    Playlist,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Folder => "folder",
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Playlist => "playlist",
            FileType::Other => "other",
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, FileType::Image | FileType::Video | FileType::Playlist)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "folder" | "dir" => Ok(FileType::Folder),
            "image" => Ok(FileType::Image),
            "video" => Ok(FileType::Video),
            "playlist" => Ok(FileType::Playlist),
            "other" => Ok(FileType::Other),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

pub const OCTET_STREAM: &str = "application/octet-stream";

const IMAGE_TYPES: &[(&str, &str)] = &[
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".webp", "image/webp"),
    (".bmp", "image/bmp"),
    (".tiff", "image/tiff"),
    (".tif", "image/tiff"),
    (".heic", "image/heic"),
    (".heif", "image/heif"),
    (".avif", "image/avif"),
    (".ico", "image/x-icon"),
    (".svg", "image/svg+xml"),
];

const VIDEO_TYPES: &[(&str, &str)] = &[
    (".mp4", "video/mp4"),
    (".m4v", "video/x-m4v"),
    (".webm", "video/webm"),
    (".mkv", "video/x-matroska"),
    (".mov", "video/quicktime"),
    (".avi", "video/x-msvideo"),
    (".wmv", "video/x-ms-wmv"),
    (".flv", "video/x-flv"),
    (".3gp", "video/3gpp"),
    (".mpg", "video/mpeg"),
    (".mpeg", "video/mpeg"),
    (".ogv", "video/ogg"),
    (".ts", "video/mp2t"),
];

const PLAYLIST_TYPES: &[(&str, &str)] = &[
    (".m3u", "audio/x-mpegurl"),
    (".m3u8", "application/vnd.apple.mpegurl"),
    (".pls", "audio/x-scpls"),
    (".xspf", "application/xspf+xml"),
    (".wpl", "application/vnd.ms-wpl"),
];

/// Precedence order for cross-listed extensions.
const TABLES: &[(FileType, &[(&str, &str)])] = &[
    (FileType::Image, IMAGE_TYPES),
    (FileType::Video, VIDEO_TYPES),
    (FileType::Playlist, PLAYLIST_TYPES),
];

/// Lowercase and prefix with a dot: `"JPG"` and `".Jpg"` both become `".jpg"`.
pub fn normalize_ext(ext: &str) -> String {
    let lower = ext.trim().to_lowercase();
    if lower.is_empty() || lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

/// Total: unknown extensions map to `(Other, "application/octet-stream")`.
pub fn classify(ext: &str) -> (FileType, &'static str) {
    let ext = normalize_ext(ext);
    for (file_type, table) in TABLES {
        if let Some((_, mime)) = table.iter().find(|(e, _)| *e == ext) {
            return (*file_type, mime);
        }
    }
    (FileType::Other, OCTET_STREAM)
}

pub fn is_media(ext: &str) -> bool {
    classify(ext).0 != FileType::Other
}

/// Classify a path by its extension. Does not touch the filesystem, so a
/// directory has to be recognised by the caller.
pub fn classify_path(path: &Path) -> (FileType, &'static str) {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => classify(ext),
        None => (FileType::Other, OCTET_STREAM),
    }
}

pub fn mime_for(path: &Path) -> &'static str {
    classify_path(path).1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_images_and_videos() {
        assert_eq!(classify(".jpg"), (FileType::Image, "image/jpeg"));
        assert_eq!(classify(".png"), (FileType::Image, "image/png"));
        assert_eq!(classify(".mp4"), (FileType::Video, "video/mp4"));
        assert_eq!(classify(".webm"), (FileType::Video, "video/webm"));
        assert_eq!(classify(".m3u8").0, FileType::Playlist);
    }

    #[test]
    fn case_insensitive_with_or_without_dot() {
        for ext in ["JPG", ".Jpg", "jpg", ".JPG"] {
            assert_eq!(classify(ext), (FileType::Image, "image/jpeg"), "{ext}");
        }
        assert_eq!(classify("MKV").0, FileType::Video);
    }

    #[test]
    fn unknown_is_other_octet_stream() {
        for ext in ["", ".txt", ".rs", "zip", ".", ".jpgx"] {
            assert_eq!(classify(ext), (FileType::Other, OCTET_STREAM), "{ext:?}");
            assert!(!is_media(ext));
        }
    }

    #[test]
    fn is_media_agrees_with_classify() {
        for (_, table) in TABLES {
            for (ext, _) in table.iter() {
                assert!(is_media(ext), "{ext}");
                assert_eq!(is_media(ext), classify(ext).0 != FileType::Other);
            }
        }
    }

    #[test]
    fn first_table_wins() {
        // Every extension resolves to the earliest table that lists it.
        for (ext, _) in TABLES.iter().flat_map(|(_, t)| t.iter()) {
            let expected = TABLES
                .iter()
                .find(|(_, t)| t.iter().any(|(e, _)| e == ext))
                .map(|(ft, _)| *ft)
                .unwrap();
            assert_eq!(classify(ext).0, expected, "{ext}");
        }
    }

    #[test]
    fn classify_path_uses_extension() {
        assert_eq!(classify_path(Path::new("/a/b/Clip.MOV")).0, FileType::Video);
        assert_eq!(classify_path(Path::new("/a/b/README")).0, FileType::Other);
        assert_eq!(mime_for(Path::new("x.svg")), "image/svg+xml");
    }

    #[test]
    fn file_type_round_trips_through_str() {
        for ft in [
            FileType::Folder,
            FileType::Image,
            FileType::Video,
            FileType::Playlist,
            FileType::Other,
        ] {
            assert_eq!(ft.as_str().parse::<FileType>().unwrap(), ft);
        }
        assert!("sound".parse::<FileType>().is_err());
    }
}

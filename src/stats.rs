//! Aggregate counts over the index, recomputed on every call.

use serde::Serialize;

use crate::error::Result;
use crate::index::Index;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Non-folder entries.
    pub total_files: i64,
    pub total_folders: i64,
    pub total_images: i64,
    pub total_videos: i64,
    pub total_playlists: i64,
    pub total_favorites: i64,
    pub total_tags: i64,
}

impl Index {
    /// One query under the connection lock, so the counts describe a single
    /// instant of index state.
    pub fn stats(&self) -> Result<Stats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT
                COALESCE(SUM(file_type != 'folder'), 0),
                COALESCE(SUM(file_type = 'folder'), 0),
                COALESCE(SUM(file_type = 'image'), 0),
                COALESCE(SUM(file_type = 'video'), 0),
                COALESCE(SUM(file_type = 'playlist'), 0),
                COALESCE(SUM(favorite = 1), 0),
                (SELECT COUNT(*) FROM tags)
             FROM files",
            [],
            |r| {
                Ok(Stats {
                    total_files: r.get(0)?,
                    total_folders: r.get(1)?,
                    total_images: r.get(2)?,
                    total_videos: r.get(3)?,
                    total_playlists: r.get(4)?,
                    total_favorites: r.get(5)?,
                    total_tags: r.get(6)?,
                })
            },
        )?;
        Ok(stats)
    }
}

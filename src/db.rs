use directories::ProjectDirs;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("dev", "lv", "lv-media") {
        dirs.data_dir().join("lv-media.db")
    } else {
        PathBuf::from("lv-media.db")
    }
}

pub fn open(path: &Path) -> Result<Connection> {
    debug!("opening db: {}", path.display());
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    debug!("db ready (WAL, FK on)");
    Ok(conn)
}

pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS files (
            id            INTEGER PRIMARY KEY,
            path          TEXT NOT NULL UNIQUE,
            parent        TEXT NOT NULL,
            name          TEXT NOT NULL,
            file_type     TEXT NOT NULL,
            size          INTEGER,
            modified_ms   INTEGER NOT NULL,
            favorite      INTEGER NOT NULL DEFAULT 0,
            indexed_at    TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tags (
            id            INTEGER PRIMARY KEY,
            name          TEXT NOT NULL UNIQUE,
            created_at    TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS file_tags (
            file_id       INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            tag_id        INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (file_id, tag_id)
        );

        CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent);
        CREATE INDEX IF NOT EXISTS idx_files_type ON files(file_type);
        CREATE INDEX IF NOT EXISTS idx_file_tags_tag ON file_tags(tag_id);
        ",
    )?;
    Ok(())
}

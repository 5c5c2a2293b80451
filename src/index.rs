//! Index store: the persistent record of folders, files, tags and favorites.
//!
//! Paths are stored relative to the media root, `/`-separated, without a
//! leading slash. The root itself is not an entry; its children have
//! `parent == ""`. Every operation runs under the connection lock, so a
//! reader never sees a half-applied write.

use rusqlite::{params, types::ToSql, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::classify::{self, FileType};
use crate::db;
use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct Index(Arc<Mutex<Connection>>);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub id: i64,
    pub path: String,
    pub parent: String,
    pub name: String,
    pub file_type: FileType,
    /// `None` for folders.
    pub size: Option<u64>,
    /// Source modification time, unix milliseconds.
    pub modified_ms: i64,
    pub favorite: bool,
    pub tags: Vec<String>,
}

impl FileEntry {
    pub fn is_folder(&self) -> bool {
        self.file_type == FileType::Folder
    }

    pub fn mime(&self) -> &'static str {
        classify::mime_for(Path::new(&self.name))
    }
}

/// One path as the scanner observed it on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub path: String,
    pub file_type: FileType,
    pub size: Option<u64>,
    pub modified_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub name: String,
    pub created_at: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Name,
    Date,
    Size,
    Type,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            SortField::Name => "f.name COLLATE NOCASE",
            SortField::Date => "f.modified_ms",
            SortField::Size => "COALESCE(f.size, -1)",
            SortField::Type => "f.file_type",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(SortField::Name),
            "date" | "modified" => Ok(SortField::Date),
            "size" => Ok(SortField::Size),
            "type" => Ok(SortField::Type),
            other => Err(format!("unknown sort field: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub file_type: Option<FileType>,
    pub favorites_only: bool,
    pub tag: Option<String>,
    /// Case-insensitive substring match on the entry name.
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub folder: String,
    pub sort: SortField,
    pub order: SortOrder,
    pub filter: Filter,
    pub recursive: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn folder(folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

pub fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, n)| n).unwrap_or(path)
}

pub fn normalize_tag(name: &str) -> Result<String> {
    let tag = name.trim().to_lowercase();
    if tag.is_empty() {
        return Err(CoreError::InvalidTag(name.to_string()));
    }
    Ok(tag)
}

const TAG_SEP: char = '\u{1f}';

const ENTRY_COLS: &str = "f.id, f.path, f.parent, f.name, f.file_type, f.size, f.modified_ms, f.favorite,
     (SELECT group_concat(t.name, char(31)) FROM file_tags ft
        JOIN tags t ON t.id = ft.tag_id WHERE ft.file_id = f.id)";

/// `f.path` equals `?N` or lies underneath it. An empty `?N` matches all.
fn subtree_clause(n: usize) -> String {
    format!("(?{n} = '' OR f.path = ?{n} OR substr(f.path, 1, length(?{n}) + 1) = ?{n} || '/')")
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

impl Index {
    pub fn new(conn: Connection) -> Self {
        Self(Arc::new(Mutex::new(conn)))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(db::open(path)?))
    }

    pub fn open_memory() -> Result<Self> {
        Ok(Self::new(db::open_memory()?))
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.0
            .lock()
            .map_err(|_| CoreError::Storage("index lock poisoned".into()))
    }

    /// Insert a new entry or refresh type/size/mtime of an existing one.
    /// Tags and the favorite flag of an existing entry are left alone.
    pub fn upsert(&self, obs: &Observed) -> Result<Upsert> {
        let size = if obs.file_type == FileType::Folder {
            None
        } else {
            obs.size.map(|s| s as i64)
        };
        let conn = self.conn()?;
        let existing: Option<(String, Option<i64>, i64)> = conn
            .query_row(
                "SELECT file_type, size, modified_ms FROM files WHERE path = ?1",
                [&obs.path],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO files (path, parent, name, file_type, size, modified_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        obs.path,
                        parent_of(&obs.path),
                        name_of(&obs.path),
                        obs.file_type.as_str(),
                        size,
                        obs.modified_ms
                    ],
                )?;
                debug!("+ {} ({})", obs.path, obs.file_type);
                Ok(Upsert::Inserted)
            }
            Some((ft, db_size, db_mtime))
                if ft == obs.file_type.as_str() && db_size == size && db_mtime == obs.modified_ms =>
            {
                Ok(Upsert::Unchanged)
            }
            Some(_) => {
                conn.execute(
                    "UPDATE files SET file_type = ?1, size = ?2, modified_ms = ?3 WHERE path = ?4",
                    params![obs.file_type.as_str(), size, obs.modified_ms, obs.path],
                )?;
                debug!("~ {} (size/mtime changed)", obs.path);
                Ok(Upsert::Updated)
            }
        }
    }

    /// Delete an entry and, for folders, everything beneath it. Tag links
    /// and favorites go with the rows. Returns the number of rows removed.
    pub fn remove(&self, path: &str) -> Result<usize> {
        if path.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM files
             WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
            [path],
        )?;
        if n > 0 {
            debug!("- {} ({} rows)", path, n);
        }
        Ok(n)
    }

    pub fn get(&self, path: &str) -> Result<FileEntry> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ENTRY_COLS} FROM files f WHERE f.path = ?1"),
            [path],
            row_to_entry,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(path.to_string()))
    }

    pub fn list(&self, q: &ListQuery) -> Result<Vec<FileEntry>> {
        let mut sql = format!("SELECT {ENTRY_COLS} FROM files f WHERE ");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(q.folder.clone())];

        if q.recursive {
            sql.push_str("(?1 = '' OR substr(f.path, 1, length(?1) + 1) = ?1 || '/')");
        } else {
            sql.push_str("f.parent = ?1");
        }
        if let Some(ft) = q.filter.file_type {
            args.push(Box::new(ft.as_str()));
            sql.push_str(&format!(" AND f.file_type = ?{}", args.len()));
        }
        if q.filter.favorites_only {
            sql.push_str(" AND f.favorite = 1");
        }
        if let Some(tag) = &q.filter.tag {
            args.push(Box::new(normalize_tag(tag)?));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id
                              WHERE ft.file_id = f.id AND t.name = ?{})",
                args.len()
            ));
        }
        if let Some(needle) = &q.filter.name_contains {
            args.push(Box::new(needle.to_lowercase()));
            sql.push_str(&format!(" AND instr(lower(f.name), ?{}) > 0", args.len()));
        }

        let dir = match q.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {} {dir}, f.path ASC", q.sort.column()));
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            q.limit.map(|l| l as i64).unwrap_or(-1),
            q.offset
        ));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_entry,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All indexed paths at or below `folder` (`""` = everything).
    pub fn paths_under(&self, folder: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT f.path FROM files f WHERE {} ORDER BY f.path",
            subtree_clause(1)
        ))?;
        let rows = stmt.query_map([folder], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    pub fn random_file(&self, favorites_only: bool) -> Result<Option<FileEntry>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLS} FROM files f
                     WHERE f.file_type != 'folder' AND (?1 = 0 OR f.favorite = 1)
                     ORDER BY RANDOM() LIMIT 1"
                ),
                [favorites_only as i64],
                row_to_entry,
            )
            .optional()?)
    }
}

// ---------------------------------------------------------------------------
// Favorites & tags
// ---------------------------------------------------------------------------

impl Index {
    pub fn set_favorite(&self, path: &str, favorite: bool) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE files SET favorite = ?1 WHERE path = ?2",
            params![favorite as i64, path],
        )?;
        if n == 0 {
            return Err(CoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Flip the favorite flag, returning the new state.
    pub fn toggle_favorite(&self, path: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE files SET favorite = 1 - favorite WHERE path = ?1",
            [path],
        )?;
        if n == 0 {
            return Err(CoreError::NotFound(path.to_string()));
        }
        let fav: i64 = conn.query_row("SELECT favorite FROM files WHERE path = ?1", [path], |r| {
            r.get(0)
        })?;
        Ok(fav != 0)
    }

    pub fn add_tag(&self, path: &str, tag: &str) -> Result<()> {
        let tag = normalize_tag(tag)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let file_id = file_id(&tx, path)?;
        tx.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", [&tag])?;
        let tag_id: i64 = tx.query_row("SELECT id FROM tags WHERE name = ?1", [&tag], |r| r.get(0))?;
        tx.execute(
            "INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?1, ?2)",
            params![file_id, tag_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop the association; the tag itself stays defined.
    pub fn remove_tag(&self, path: &str, tag: &str) -> Result<()> {
        let tag = normalize_tag(tag)?;
        let conn = self.conn()?;
        let file_id = file_id(&conn, path)?;
        conn.execute(
            "DELETE FROM file_tags
             WHERE file_id = ?1 AND tag_id = (SELECT id FROM tags WHERE name = ?2)",
            params![file_id, tag],
        )?;
        Ok(())
    }

    /// Delete a tag definition and all its associations. Tagged files stay.
    pub fn delete_tag(&self, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        let n = self.conn()?.execute("DELETE FROM tags WHERE name = ?1", [&tag])?;
        Ok(n > 0)
    }

    pub fn tags(&self) -> Result<Vec<TagInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.name, COALESCE(t.created_at, ''), COUNT(ft.file_id)
             FROM tags t LEFT JOIN file_tags ft ON ft.tag_id = t.id
             GROUP BY t.id ORDER BY t.name",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(TagInfo {
                name: r.get(0)?,
                created_at: r.get(1)?,
                count: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tags_for(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.get(path)?.tags)
    }
}

fn file_id(conn: &Connection, path: &str) -> Result<i64> {
    conn.query_row("SELECT id FROM files WHERE path = ?1", [path], |r| r.get(0))
        .optional()?
        .ok_or_else(|| CoreError::NotFound(path.to_string()))
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<FileEntry> {
    let file_type: String = row.get(4)?;
    let tags: Option<String> = row.get(8)?;
    let mut tags: Vec<String> = tags
        .map(|s| s.split(TAG_SEP).map(str::to_string).collect())
        .unwrap_or_default();
    tags.sort();
    Ok(FileEntry {
        id: row.get(0)?,
        path: row.get(1)?,
        parent: row.get(2)?,
        name: row.get(3)?,
        file_type: file_type.parse().unwrap_or(FileType::Other),
        size: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
        modified_ms: row.get(6)?,
        favorite: row.get::<_, i64>(7)? != 0,
        tags,
    })
}

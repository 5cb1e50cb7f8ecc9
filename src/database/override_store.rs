use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::DatabaseError;
use crate::core::cluster::NonDuplicateOverride;
use crate::core::{lock, rebase_path};

/// Persistent per-album "not a duplicate" sets.
pub trait OverrideStore: Send + Sync {
    fn load(&self, album: &Path) -> Result<Vec<NonDuplicateOverride>, DatabaseError>;

    /// Returns `false` when the same set was already stored for the album.
    fn insert(&self, entry: &NonDuplicateOverride) -> Result<bool, DatabaseError>;

    /// Returns `false` when no such set was stored.
    fn remove(&self, entry: &NonDuplicateOverride) -> Result<bool, DatabaseError>;

    fn albums(&self) -> Result<Vec<PathBuf>, DatabaseError>;

    /// Moves overrides of `old` and of every album below it. Returns the number of albums moved.
    fn rename_album(&self, old: &Path, new: &Path) -> Result<usize, DatabaseError>;

    /// Returns the number of overrides removed.
    fn clear_album(&self, album: &Path) -> Result<usize, DatabaseError>;
}

fn members_json(members: &BTreeSet<String>) -> Result<String, DatabaseError> {
    Ok(serde_json::to_string(members)?)
}

fn album_key(album: &Path) -> String {
    album.to_string_lossy().to_string()
}

pub struct SqliteOverrideStore {
    conn: Mutex<Connection>,
}

impl SqliteOverrideStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS non_duplicates (
                album_path TEXT NOT NULL,
                members TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (album_path, members)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl OverrideStore for SqliteOverrideStore {
    fn load(&self, album: &Path) -> Result<Vec<NonDuplicateOverride>, DatabaseError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT members FROM non_duplicates WHERE album_path = ?1 ORDER BY created_at, members",
        )?;
        let rows = stmt.query_map(params![album_key(album)], |row| row.get::<_, String>(0))?;

        let mut overrides = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<BTreeSet<String>>(&json) {
                Ok(members) if members.len() >= 2 => overrides.push(NonDuplicateOverride {
                    album_path: album.to_path_buf(),
                    members,
                }),
                Ok(_) => log::warn!(
                    "Ignoring override with fewer than two members in {}",
                    album.display()
                ),
                Err(e) => log::warn!("Ignoring unreadable override in {}: {}", album.display(), e),
            }
        }
        Ok(overrides)
    }

    fn insert(&self, entry: &NonDuplicateOverride) -> Result<bool, DatabaseError> {
        let members = members_json(&entry.members)?;
        let conn = lock(&self.conn);
        let changed = conn.execute(
            "INSERT OR IGNORE INTO non_duplicates (album_path, members, created_at)
             VALUES (?1, ?2, ?3)",
            params![album_key(&entry.album_path), members, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn remove(&self, entry: &NonDuplicateOverride) -> Result<bool, DatabaseError> {
        let members = members_json(&entry.members)?;
        let conn = lock(&self.conn);
        let changed = conn.execute(
            "DELETE FROM non_duplicates WHERE album_path = ?1 AND members = ?2",
            params![album_key(&entry.album_path), members],
        )?;
        Ok(changed > 0)
    }

    fn albums(&self) -> Result<Vec<PathBuf>, DatabaseError> {
        let conn = lock(&self.conn);
        let mut stmt =
            conn.prepare("SELECT DISTINCT album_path FROM non_duplicates ORDER BY album_path")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut albums = Vec::new();
        for row in rows {
            albums.push(PathBuf::from(row?));
        }
        Ok(albums)
    }

    fn rename_album(&self, old: &Path, new: &Path) -> Result<usize, DatabaseError> {
        let mut moves: Vec<(PathBuf, PathBuf)> = self
            .albums()?
            .into_iter()
            .filter_map(|album| rebase_path(&album, old, new).map(|target| (album, target)))
            .collect();
        // Deepest first, so a move into a descendant of `old` never moves rows twice.
        moves.sort_by_key(|(from, _)| Reverse(from.components().count()));
        if moves.is_empty() {
            return Ok(0);
        }

        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        for (from, to) in &moves {
            tx.execute(
                "INSERT OR IGNORE INTO non_duplicates (album_path, members, created_at)
                 SELECT ?2, members, created_at FROM non_duplicates WHERE album_path = ?1",
                params![album_key(from), album_key(to)],
            )?;
            tx.execute(
                "DELETE FROM non_duplicates WHERE album_path = ?1",
                params![album_key(from)],
            )?;
        }
        tx.commit()?;
        Ok(moves.len())
    }

    fn clear_album(&self, album: &Path) -> Result<usize, DatabaseError> {
        let conn = lock(&self.conn);
        let removed = conn.execute(
            "DELETE FROM non_duplicates WHERE album_path = ?1",
            params![album_key(album)],
        )?;
        Ok(removed)
    }
}

impl SqliteOverrideStore {
    /// Creation time of a stored override, if present.
    pub fn created_at(
        &self,
        entry: &NonDuplicateOverride,
    ) -> Result<Option<String>, DatabaseError> {
        let members = members_json(&entry.members)?;
        let conn = lock(&self.conn);
        let created = conn
            .query_row(
                "SELECT created_at FROM non_duplicates WHERE album_path = ?1 AND members = ?2",
                params![album_key(&entry.album_path), members],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(created)
    }
}

#[derive(Default)]
pub struct MemoryOverrideStore {
    albums: Mutex<HashMap<PathBuf, Vec<BTreeSet<String>>>>,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverrideStore for MemoryOverrideStore {
    fn load(&self, album: &Path) -> Result<Vec<NonDuplicateOverride>, DatabaseError> {
        Ok(lock(&self.albums)
            .get(album)
            .map(|sets| {
                sets.iter()
                    .map(|members| NonDuplicateOverride {
                        album_path: album.to_path_buf(),
                        members: members.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn insert(&self, entry: &NonDuplicateOverride) -> Result<bool, DatabaseError> {
        let mut albums = lock(&self.albums);
        let sets = albums.entry(entry.album_path.clone()).or_default();
        if sets.contains(&entry.members) {
            return Ok(false);
        }
        sets.push(entry.members.clone());
        Ok(true)
    }

    fn remove(&self, entry: &NonDuplicateOverride) -> Result<bool, DatabaseError> {
        let mut albums = lock(&self.albums);
        let Some(sets) = albums.get_mut(&entry.album_path) else {
            return Ok(false);
        };
        let before = sets.len();
        sets.retain(|members| members != &entry.members);
        let removed = sets.len() < before;
        if sets.is_empty() {
            albums.remove(&entry.album_path);
        }
        Ok(removed)
    }

    fn albums(&self) -> Result<Vec<PathBuf>, DatabaseError> {
        let mut albums: Vec<PathBuf> = lock(&self.albums).keys().cloned().collect();
        albums.sort();
        Ok(albums)
    }

    fn rename_album(&self, old: &Path, new: &Path) -> Result<usize, DatabaseError> {
        let mut albums = lock(&self.albums);
        let mut moves: Vec<(PathBuf, PathBuf)> = albums
            .keys()
            .filter_map(|album| rebase_path(album, old, new).map(|target| (album.clone(), target)))
            .collect();
        moves.sort_by_key(|(from, _)| Reverse(from.components().count()));
        for (from, to) in &moves {
            if let Some(sets) = albums.remove(from) {
                let target = albums.entry(to.clone()).or_default();
                for members in sets {
                    if !target.contains(&members) {
                        target.push(members);
                    }
                }
            }
        }
        Ok(moves.len())
    }

    fn clear_album(&self, album: &Path) -> Result<usize, DatabaseError> {
        Ok(lock(&self.albums).remove(album).map_or(0, |sets| sets.len()))
    }
}

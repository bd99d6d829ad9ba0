pub mod migrate;
pub mod models;
pub mod queries;

use rusqlite::{Connection, OptionalExtension, params};
use rusqlite::ffi::ErrorCode;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invariant violation: {0}")]
    Invariant(String),
    #[error("Migration to version {version} failed: {message}")]
    Migration { version: u32, message: String },
    #[error("Unsupported store version marker {0:?}")]
    UnsupportedVersion(String),
}

impl StoreError {
    /// True for failures of the store itself (file unreadable, disk full,
    /// corruption) as opposed to failures local to one transaction.
    pub fn is_store_level(&self) -> bool {
        match self {
            Self::Io(_) | Self::UnsupportedVersion(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Schema generation written by this build.
pub const CURRENT_VERSION: u32 = 3;

pub struct Store {
    pub conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store file without migrating it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        Ok(store)
    }

    /// Fresh in-memory store at the current schema version.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, path: None };
        store.init()?;
        store.migrate_to(CURRENT_VERSION, |_| {})?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        // Touch the schema so a non-SQLite file fails here, not mid-operation
        self.conn
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Read the version marker.
    ///
    /// 0 = empty file, 1-3 = marked generations. A file holding the V1 tables
    /// but no `store_info` table predates the marker and reads as version 1.
    pub fn version(&self) -> Result<u32> {
        read_version(&self.conn)
    }

    pub fn is_version2(&self) -> Result<bool> {
        Ok(self.version()? >= 2)
    }

    pub fn is_version3(&self) -> Result<bool> {
        Ok(self.version()? >= 3)
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn read_version(conn: &Connection) -> Result<u32> {
    if !table_exists(conn, "store_info")? {
        return Ok(if table_exists(conn, "songs")? { 1 } else { 0 });
    }
    let marker: Option<String> = conn
        .query_row(
            "SELECT value FROM store_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match marker {
        None => Ok(if table_exists(conn, "songs")? { 1 } else { 0 }),
        Some(text) => match text.trim().parse::<u32>() {
            Ok(v) if v <= CURRENT_VERSION => Ok(v),
            _ => Err(StoreError::UnsupportedVersion(text)),
        },
    }
}

/// Write the version marker (used inside a migration step's transaction).
pub(crate) fn write_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_info (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );",
    )?;
    conn.execute(
        "INSERT INTO store_info (key, value) VALUES ('version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_is_current() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.version().unwrap(), CURRENT_VERSION);
        assert!(store.is_version2().unwrap());
        assert!(store.is_version3().unwrap());
    }

    #[test]
    fn test_empty_file_is_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("profile.db")).unwrap();
        assert_eq!(store.version().unwrap(), 0);
        assert!(!store.is_version2().unwrap());
    }

    #[test]
    fn test_future_marker_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        write_version(&store.conn, 99).unwrap();
        let err = store.version().unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion(ref v) if v == "99"));
        assert!(err.is_store_level());
    }

    #[test]
    fn test_non_database_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        match Store::open(&path) {
            Err(e) => assert!(e.is_store_level(), "unexpected error class: {e}"),
            Ok(_) => panic!("garbage file opened as a store"),
        }
    }

    #[test]
    fn test_constraint_errors_are_transaction_local() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .conn
            .execute("INSERT INTO songs (title, artist_id) VALUES ('x', 999)", [])
            .map_err(StoreError::from)
            .unwrap_err();
        assert!(!err.is_store_level());
    }
}

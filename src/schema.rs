//! # SQLite Schema for the Reference Driver
//!
//! This module defines the tables used by [`SqliteStore`](crate::sqlite::SqliteStore)
//! and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  objects                         kv                 snapshots           │
//! │  ┌──────────────────────┐        ┌──────────────┐   ┌──────────────┐    │
//! │  │ system, uid (PK)     │        │ system, key  │   │ system,      │    │
//! │  │ origin_uid (archive) │        │ value        │   │ number (PK)  │    │
//! │  │ ver, deleted, archive│        └──────────────┘   │ uid, dt      │    │
//! │  │ key1..key5  (unique) │                           └──────────────┘    │
//! │  │ label1..label5       │        logs               quick / stats       │
//! │  │ payload              │        ┌──────────────┐   ┌──────────────┐    │
//! │  └──────────────────────┘        │ id (PK)      │   │ high-churn   │    │
//! │                                  │ labels, text │   │ blobs; stats │    │
//! │                                  └──────────────┘   └──────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### One table for live, deleted and archived rows
//!
//! Deleted rows are retained (never physically removed) and archived copies
//! share every column with the live row, so a single table with `deleted` and
//! `archive` flags keeps the row codec in one place. Key uniqueness is
//! enforced by *partial* unique indices that only cover live rows.
//!
//! ### Timestamps as INTEGER microseconds
//!
//! The lazy flush guard compares `update_dt` values for strict ordering, so
//! the stored precision must match the in-memory precision exactly.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Versioned objects: live, deleted and archived rows.
///
/// `origin_uid` is set only on archived copies and names the live row the copy
/// was taken from.
const CREATE_OBJECTS: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    system      TEXT    NOT NULL,
    uid         TEXT    NOT NULL,
    origin_uid  TEXT,
    type_name   TEXT    NOT NULL,
    namespace   TEXT    NOT NULL,
    ver         INTEGER NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0,
    archive     INTEGER NOT NULL DEFAULT 0,
    snapshot_no INTEGER NOT NULL,
    create_dt   INTEGER NOT NULL,
    update_dt   INTEGER NOT NULL,
    delete_dt   INTEGER,
    key1 TEXT, key2 TEXT, key3 TEXT, key4 TEXT, key5 TEXT,
    label1 TEXT, label2 TEXT, label3 TEXT, label4 TEXT, label5 TEXT,
    ext1        TEXT,
    ext2        TEXT,
    search1     TEXT,
    search2     TEXT,
    payload     TEXT    NOT NULL,
    PRIMARY KEY (system, uid)
)
"#;

/// Supports partial reloads (`update_dt >= ?`) and full reloads.
const CREATE_OBJECTS_UPDATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS objects_update_dt
ON objects(system, archive, update_dt)
"#;

/// Supports archive listing and trimming.
const CREATE_OBJECTS_ORIGIN_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS objects_origin
ON objects(system, origin_uid, ver)
"#;

/// Unique key index for one key column, covering live rows only.
fn create_key_index(column: usize) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS objects_key{column} \
         ON objects(system, type_name, namespace, key{column}) \
         WHERE key{column} IS NOT NULL AND deleted = 0 AND archive = 0"
    )
}

/// Non-unique label index for one label column.
fn create_label_index(column: usize) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS objects_label{column} \
         ON objects(system, type_name, namespace, label{column}) \
         WHERE label{column} IS NOT NULL AND archive = 0"
    )
}

/// Engine key-value table: snapshot counters and dynamic config live here.
const CREATE_KV: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    system TEXT NOT NULL,
    key    TEXT NOT NULL,
    value  TEXT NOT NULL,
    PRIMARY KEY (system, key)
)
"#;

/// Snapshot markers, one per generation number.
const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    system      TEXT    NOT NULL,
    number      INTEGER NOT NULL,
    uid         TEXT    NOT NULL,
    created_dt  INTEGER NOT NULL,
    description TEXT    NOT NULL,
    PRIMARY KEY (system, number)
)
"#;

/// Append-only log records.
const CREATE_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    system      TEXT    NOT NULL,
    created_dt  INTEGER NOT NULL,
    snapshot_no INTEGER NOT NULL,
    namespace   TEXT    NOT NULL,
    kind        TEXT    NOT NULL,
    label1 TEXT, label2 TEXT, label3 TEXT, label4 TEXT, label5 TEXT,
    message     TEXT    NOT NULL,
    data        TEXT
)
"#;

const CREATE_LOGS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS logs_created
ON logs(system, created_dt)
"#;

/// Quick-lookup key → blob rows.
const CREATE_QUICK: &str = r#"
CREATE TABLE IF NOT EXISTS quick (
    system     TEXT    NOT NULL,
    key        TEXT    NOT NULL,
    value      BLOB    NOT NULL,
    updated_dt INTEGER NOT NULL,
    PRIMARY KEY (system, key)
)
"#;

/// Periodic statistics records.
const CREATE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS stats (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    system     TEXT    NOT NULL,
    created_dt INTEGER NOT NULL,
    body       TEXT    NOT NULL
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS hadb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the HADB schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`. [`Database::into_connection`] hands the
/// connection to the driver's pool once the schema is verified.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Config` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use hadb::Database;
    ///
    /// let db = Database::open("hadb.db")?;
    /// # Ok::<(), hadb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers do not block the single writer.
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_OBJECTS)?;
        self.conn.execute_batch(CREATE_OBJECTS_UPDATE_INDEX)?;
        self.conn.execute_batch(CREATE_OBJECTS_ORIGIN_INDEX)?;
        for column in 1..=crate::types::MAX_INDEX_FIELDS {
            self.conn.execute_batch(&create_key_index(column))?;
            self.conn.execute_batch(&create_label_index(column))?;
        }
        self.conn.execute_batch(CREATE_KV)?;
        self.conn.execute_batch(CREATE_SNAPSHOTS)?;
        self.conn.execute_batch(CREATE_LOGS)?;
        self.conn.execute_batch(CREATE_LOGS_INDEX)?;
        self.conn.execute_batch(CREATE_QUICK)?;
        self.conn.execute_batch(CREATE_STATS)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM hadb_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO hadb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Config(format!(
                    "schema version mismatch: database has version {v}, but this engine requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i32 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");
        // metadata, objects, kv, snapshots, logs, quick, stats
        assert_eq!(table_count(&db.conn), 7);
    }

    #[test]
    fn test_key_indexes_are_partial_and_unique() {
        let db = Database::open_in_memory().expect("should create db");
        let sql: String = db
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = 'objects_key1'",
                [],
                |row| row.get(0),
            )
            .expect("should find key index");
        assert!(sql.contains("UNIQUE"));
        assert!(sql.contains("deleted = 0 AND archive = 0"));
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }
        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(&db.conn), 7);
    }
}

//! # SQLite Reference Driver
//!
//! [`SqliteStore`] implements the [`BackingStore`] contract on top of a single
//! SQLite file. It is what the integration tests and the bench binary run
//! against, and it is a reasonable store for single-host deployments.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         SqliteStore                            │
//! │                                                                │
//! │   begin(mode) ──► idle pool ──► Connection ──► SqliteSession   │
//! │                    ▲                               │           │
//! │                    └──── returned on drop ◄────────┘           │
//! │                                                                │
//! │   Every statement runs on the blocking pool (spawn_blocking);  │
//! │   the session moves its Connection in and back out.            │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 ▼
//!                         ┌───────────────┐
//!                         │ SQLite (WAL)  │
//!                         └───────────────┘
//! ```
//!
//! ## Locking
//!
//! Write sessions open with `BEGIN IMMEDIATE`, so the single SQLite write lock
//! is taken up front and contention shows up at `begin`, not halfway through a
//! transaction body. A writer that cannot get the lock within the busy timeout
//! fails with `SQLITE_BUSY`, which this driver reports as
//! [`Error::Deadlock`] so the transaction engine retries it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::store::{BackingStore, StoreSession};
use crate::types::{
    to_micros, IndexFields, LogQuery, LogRecord, ObjectFilter, QuickEntry, Snapshot, StatRecord,
    StoredObject, Timestamp, TxnMode, Uid, MAX_INDEX_FIELDS,
};

// =============================================================================
// Options
// =============================================================================

/// Tuning for the SQLite driver.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// How long a statement waits on a locked database before failing with
    /// `SQLITE_BUSY`.
    pub busy_timeout: Duration,

    /// Idle connections kept for reuse.
    pub max_idle: usize,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(1000),
            max_idle: 8,
        }
    }
}

// =============================================================================
// Connection Pool
// =============================================================================

#[derive(Debug)]
struct Pool {
    path: PathBuf,
    options: SqliteOptions,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    fn acquire(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.options.busy_timeout)?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.options.max_idle {
            idle.push(conn);
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// SQLite-backed implementation of [`BackingStore`].
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Arc<Pool>,
}

impl SqliteStore {
    /// Opens (and if needed creates) the database file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, SqliteOptions::default())
    }

    /// Opens the database file with explicit options.
    pub fn open_with(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Database::open(&path)?.into_connection();
        conn.busy_timeout(options.busy_timeout)?;
        let pool = Pool {
            path,
            options,
            idle: Mutex::new(vec![conn]),
        };
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.pool.path
    }
}

#[async_trait]
impl BackingStore for SqliteStore {
    type Session = SqliteSession;

    async fn begin(&self, mode: TxnMode) -> Result<SqliteSession> {
        let pool = Arc::clone(&self.pool);
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = pool.acquire()?;
            let begin = match mode {
                TxnMode::Write => "BEGIN IMMEDIATE",
                TxnMode::Read => "BEGIN DEFERRED",
            };
            if let Err(e) = conn.execute_batch(begin) {
                pool.release(conn);
                return Err(e.into());
            }
            Ok(conn)
        })
        .await
        .map_err(join_error)?
        .map_err(classify)?;

        Ok(SqliteSession {
            conn: Some(conn),
            pool: Arc::clone(&self.pool),
            active: true,
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::BackingStoreUnavailable(format!("sqlite worker failed: {e}"))
}

/// Maps raw SQLite failures onto the engine's error taxonomy.
fn classify(err: Error) -> Error {
    match err {
        Error::Sqlite(rusqlite::Error::SqliteFailure(ffi, message)) => match ffi.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                Error::deadlock(message.unwrap_or_else(|| ffi.to_string()))
            }
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::PermissionDenied => {
                Error::BackingStoreUnavailable(message.unwrap_or_else(|| ffi.to_string()))
            }
            _ => Error::Sqlite(rusqlite::Error::SqliteFailure(ffi, message)),
        },
        other => other,
    }
}

/// Maps a uniqueness violation on a key column to [`Error::KeyConflict`].
///
/// SQLite names the failing index columns in the message, e.g.
/// `UNIQUE constraint failed: objects.system, ..., objects.key2`.
fn constraint_error(err: rusqlite::Error, row: &StoredObject) -> Error {
    if let rusqlite::Error::SqliteFailure(ffi, Some(message)) = &err {
        if ffi.code == ErrorCode::ConstraintViolation {
            if let Some(column) = violated_key_column(message) {
                return Error::KeyConflict {
                    type_name: row.type_name.clone(),
                    namespace: row.namespace.clone(),
                    column,
                    key: row.keys.get(column - 1).unwrap_or_default().to_string(),
                };
            }
            if message.contains("objects.uid") {
                return Error::Consistency(format!("duplicate uid '{}'", row.uid));
            }
        }
    }
    err.into()
}

fn violated_key_column(message: &str) -> Option<usize> {
    const MARKER: &str = "objects.key";
    let at = message.rfind(MARKER)?;
    let digit = message[at + MARKER.len()..].chars().next()?.to_digit(10)? as usize;
    (1..=MAX_INDEX_FIELDS).contains(&digit).then_some(digit)
}

// =============================================================================
// Row Codec
// =============================================================================

const OBJECT_COLUMNS: [&str; 26] = [
    "uid", "origin_uid", "type_name", "namespace", "ver", "deleted", "archive", "snapshot_no",
    "create_dt", "update_dt", "delete_dt", "key1", "key2", "key3", "key4", "key5", "label1",
    "label2", "label3", "label4", "label5", "ext1", "ext2", "search1", "search2", "payload",
];

fn select_objects() -> String {
    format!("SELECT {} FROM objects", OBJECT_COLUMNS.join(", "))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let micros: i64 = row.get(idx)?;
    chrono::Utc
        .timestamp_micros(micros)
        .single()
        .ok_or_else(|| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, "timestamp out of range".into()))
}

fn fields_at(row: &Row<'_>, first: usize) -> rusqlite::Result<IndexFields> {
    let mut fields = IndexFields::empty();
    for slot in 0..MAX_INDEX_FIELDS {
        let value: Option<String> = row.get(first + slot)?;
        fields.set(slot, value.as_deref());
    }
    Ok(fields)
}

fn read_object(row: &Row<'_>) -> rusqlite::Result<StoredObject> {
    let delete_micros: Option<i64> = row.get(10)?;
    let delete_dt = match delete_micros {
        Some(_) => Some(timestamp_at(row, 10)?),
        None => None,
    };
    Ok(StoredObject {
        uid: Uid::new(row.get::<_, String>(0)?),
        origin_uid: row.get::<_, Option<String>>(1)?.map(Uid::new),
        type_name: row.get(2)?,
        namespace: row.get(3)?,
        ver: row.get(4)?,
        deleted: row.get(5)?,
        archive: row.get(6)?,
        snapshot_no: row.get(7)?,
        create_dt: timestamp_at(row, 8)?,
        update_dt: timestamp_at(row, 9)?,
        delete_dt,
        keys: fields_at(row, 11)?,
        labels: fields_at(row, 16)?,
        ext1: row.get(21)?,
        ext2: row.get(22)?,
        search1: row.get(23)?,
        search2: row.get(24)?,
        payload: row.get(25)?,
    })
}

fn opt_text(value: &Option<String>) -> Value {
    value.clone().map(Value::Text).unwrap_or(Value::Null)
}

/// Parameter values in `OBJECT_COLUMNS` order, prefixed by the system name.
fn object_values(system: &str, row: &StoredObject) -> Vec<Value> {
    let mut values = vec![
        Value::Text(system.to_string()),
        Value::Text(row.uid.as_str().to_string()),
        row.origin_uid
            .as_ref()
            .map(|u| Value::Text(u.as_str().to_string()))
            .unwrap_or(Value::Null),
        Value::Text(row.type_name.clone()),
        Value::Text(row.namespace.clone()),
        Value::Integer(row.ver),
        Value::Integer(row.deleted as i64),
        Value::Integer(row.archive as i64),
        Value::Integer(row.snapshot_no),
        Value::Integer(to_micros(row.create_dt)),
        Value::Integer(to_micros(row.update_dt)),
        row.delete_dt.map(|dt| Value::Integer(to_micros(dt))).unwrap_or(Value::Null),
    ];
    values.extend(row.keys.slots().iter().map(opt_text));
    values.extend(row.labels.slots().iter().map(opt_text));
    values.push(opt_text(&row.ext1));
    values.push(opt_text(&row.ext2));
    values.push(opt_text(&row.search1));
    values.push(opt_text(&row.search2));
    values.push(Value::Text(row.payload.clone()));
    values
}

fn query_objects(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<StoredObject>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), read_object)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn read_log(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get(0)?,
        created_at: timestamp_at(row, 1)?,
        snapshot_no: row.get(2)?,
        namespace: row.get(3)?,
        kind: row.get(4)?,
        labels: fields_at(row, 5)?,
        message: row.get(10)?,
        data: row.get(11)?,
    })
}

// =============================================================================
// Session
// =============================================================================

/// One SQLite transaction. Dropping an uncommitted session rolls it back and
/// returns the connection to the pool.
pub struct SqliteSession {
    conn: Option<Connection>,
    pool: Arc<Pool>,
    active: bool,
}

impl SqliteSession {
    /// Runs `f` against the session's connection on the blocking pool.
    async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| Error::BackingStoreUnavailable("session connection was lost".to_string()))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(join_error)?;
        self.conn = Some(conn);
        result.map_err(classify)
    }

    async fn finish(&mut self, statement: &'static str) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.run(move |conn| Ok(conn.execute_batch(statement)?)).await?;
        self.active = false;
        Ok(())
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.active {
                let _ = conn.execute_batch("ROLLBACK");
            }
            self.pool.release(conn);
        }
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    // -------------------------------------------------------------------------
    // Key-value table
    // -------------------------------------------------------------------------

    async fn kv_get(&mut self, system: &str, key: &str) -> Result<Option<String>> {
        let (system, key) = (system.to_string(), key.to_string());
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM kv WHERE system = ?1 AND key = ?2",
                    params![system, key],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn kv_set(&mut self, system: &str, key: &str, value: &str) -> Result<()> {
        let (system, key, value) = (system.to_string(), key.to_string(), value.to_string());
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO kv (system, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(system, key) DO UPDATE SET value = excluded.value",
                params![system, key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn kv_list(&mut self, system: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        let (system, prefix) = (system.to_string(), prefix.to_string());
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key, value FROM kv
                 WHERE system = ?1 AND substr(key, 1, length(?2)) = ?2
                 ORDER BY key",
            )?;
            let pairs = stmt
                .query_map(params![system, prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pairs)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    async fn fetch_object(&mut self, system: &str, uid: &Uid) -> Result<Option<StoredObject>> {
        let values = vec![Value::Text(system.to_string()), Value::Text(uid.as_str().to_string())];
        self.run(move |conn| {
            let sql = format!("{} WHERE system = ?1 AND uid = ?2", select_objects());
            Ok(query_objects(conn, &sql, values)?.into_iter().next())
        })
        .await
    }

    async fn find_by_keys(
        &mut self,
        system: &str,
        type_name: &str,
        namespace: &str,
        keys: &IndexFields,
    ) -> Result<Vec<StoredObject>> {
        let (system, type_name, namespace, keys) =
            (system.to_string(), type_name.to_string(), namespace.to_string(), keys.clone());
        self.run(move |conn| {
            let mut found: Vec<StoredObject> = Vec::new();
            for (slot, value) in keys.filled() {
                let sql = format!(
                    "{} WHERE system = ?1 AND type_name = ?2 AND namespace = ?3 AND key{} = ?4
                     AND deleted = 0 AND archive = 0",
                    select_objects(),
                    slot + 1
                );
                let values = vec![
                    Value::Text(system.clone()),
                    Value::Text(type_name.clone()),
                    Value::Text(namespace.clone()),
                    Value::Text(value.to_string()),
                ];
                for row in query_objects(conn, &sql, values)? {
                    if !found.iter().any(|f| f.uid == row.uid) {
                        found.push(row);
                    }
                }
            }
            Ok(found)
        })
        .await
    }

    async fn find_by_labels(
        &mut self,
        system: &str,
        type_name: &str,
        namespace: &str,
        labels: &IndexFields,
    ) -> Result<Vec<StoredObject>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "{} WHERE system = ?1 AND type_name = ?2 AND namespace = ?3 AND deleted = 0 AND archive = 0",
            select_objects()
        );
        let mut values = vec![
            Value::Text(system.to_string()),
            Value::Text(type_name.to_string()),
            Value::Text(namespace.to_string()),
        ];
        for (slot, value) in labels.filled() {
            values.push(Value::Text(value.to_string()));
            sql.push_str(&format!(" AND label{} = ?{}", slot + 1, values.len()));
        }
        self.run(move |conn| query_objects(conn, &sql, values)).await
    }

    async fn load_objects(&mut self, system: &str, filter: &ObjectFilter) -> Result<Vec<StoredObject>> {
        let mut sql = format!("{} WHERE system = ?1 AND archive = 0", select_objects());
        let mut values = vec![Value::Text(system.to_string())];
        if let Some(since) = filter.updated_since {
            values.push(Value::Integer(to_micros(since)));
            sql.push_str(&format!(" AND update_dt >= ?{}", values.len()));
        }
        if let Some(type_name) = &filter.type_name {
            values.push(Value::Text(type_name.clone()));
            sql.push_str(&format!(" AND type_name = ?{}", values.len()));
        }
        self.run(move |conn| query_objects(conn, &sql, values)).await
    }

    async fn insert_object(&mut self, system: &str, row: &StoredObject) -> Result<()> {
        let values = object_values(system, row);
        let row = row.clone();
        self.run(move |conn| {
            let placeholders = vec!["?"; values.len()].join(", ");
            let sql = format!(
                "INSERT INTO objects (system, {}) VALUES ({})",
                OBJECT_COLUMNS.join(", "),
                placeholders
            );
            conn.execute(&sql, params_from_iter(values))
                .map_err(|e| constraint_error(e, &row))?;
            Ok(())
        })
        .await
    }

    async fn update_object(&mut self, system: &str, row: &StoredObject, expected_ver: i64) -> Result<u64> {
        let mut values = object_values(system, row);
        values.push(Value::Integer(expected_ver));
        let expected_param = values.len();
        let row = row.clone();
        self.run(move |conn| {
            // ?1 = system, ?2 = uid, columns after uid start at ?3.
            let assignments = OBJECT_COLUMNS[1..]
                .iter()
                .enumerate()
                .map(|(i, col)| format!("{col} = ?{}", i + 3))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE objects SET {assignments}
                 WHERE system = ?1 AND uid = ?2 AND ver = ?{expected_param} AND archive = 0"
            );
            let affected = conn
                .execute(&sql, params_from_iter(values))
                .map_err(|e| constraint_error(e, &row))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn update_object_if_older(&mut self, system: &str, row: &StoredObject) -> Result<u64> {
        let values = vec![
            Value::Text(system.to_string()),
            Value::Text(row.uid.as_str().to_string()),
            Value::Integer(to_micros(row.update_dt)),
            Value::Text(row.payload.clone()),
            opt_text(&row.search1),
            opt_text(&row.search2),
            opt_text(&row.ext1),
            opt_text(&row.ext2),
            Value::Integer(row.ver),
        ];
        self.run(move |conn| {
            let affected = conn.execute(
                "UPDATE objects
                 SET update_dt = ?3, payload = ?4, search1 = ?5, search2 = ?6, ext1 = ?7, ext2 = ?8
                 WHERE system = ?1 AND uid = ?2 AND ver = ?9 AND update_dt < ?3
                   AND deleted = 0 AND archive = 0",
                params_from_iter(values),
            )?;
            Ok(affected as u64)
        })
        .await
    }

    async fn list_archives(&mut self, system: &str, origin: &Uid) -> Result<Vec<StoredObject>> {
        let values = vec![Value::Text(system.to_string()), Value::Text(origin.as_str().to_string())];
        self.run(move |conn| {
            let sql = format!(
                "{} WHERE system = ?1 AND origin_uid = ?2 AND archive = 1 ORDER BY ver DESC",
                select_objects()
            );
            query_objects(conn, &sql, values)
        })
        .await
    }

    async fn delete_archives(&mut self, system: &str, uids: &[Uid]) -> Result<u64> {
        let system = system.to_string();
        let uids: Vec<String> = uids.iter().map(|u| u.as_str().to_string()).collect();
        self.run(move |conn| {
            let mut stmt =
                conn.prepare_cached("DELETE FROM objects WHERE system = ?1 AND uid = ?2 AND archive = 1")?;
            let mut removed = 0u64;
            for uid in &uids {
                removed += stmt.execute(params![system, uid])? as u64;
            }
            Ok(removed)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    async fn insert_snapshot(&mut self, system: &str, snapshot: &Snapshot) -> Result<()> {
        let system = system.to_string();
        let snapshot = snapshot.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO snapshots (system, number, uid, created_dt, description)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    system,
                    snapshot.number,
                    snapshot.uid.as_str(),
                    to_micros(snapshot.created_at),
                    snapshot.description
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_snapshots(&mut self, system: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let system = system.to_string();
        let limit = if limit == 0 { -1 } else { limit as i64 };
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT uid, number, created_dt, description FROM snapshots
                 WHERE system = ?1 ORDER BY number DESC LIMIT ?2",
            )?;
            let snapshots = stmt
                .query_map(params![system, limit], |row| {
                    Ok(Snapshot {
                        uid: Uid::new(row.get::<_, String>(0)?),
                        number: row.get(1)?,
                        created_at: timestamp_at(row, 2)?,
                        description: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(snapshots)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------------

    async fn append_log(&mut self, system: &str, record: &LogRecord) -> Result<i64> {
        let mut values = vec![
            Value::Text(system.to_string()),
            Value::Integer(to_micros(record.created_at)),
            Value::Integer(record.snapshot_no),
            Value::Text(record.namespace.clone()),
            Value::Text(record.kind.clone()),
        ];
        values.extend(record.labels.slots().iter().map(opt_text));
        values.push(Value::Text(record.message.clone()));
        values.push(opt_text(&record.data));
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO logs (system, created_dt, snapshot_no, namespace, kind,
                                   label1, label2, label3, label4, label5, message, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params_from_iter(values),
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn query_logs(&mut self, system: &str, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let mut sql = String::from(
            "SELECT id, created_dt, snapshot_no, namespace, kind,
                    label1, label2, label3, label4, label5, message, data
             FROM logs WHERE system = ?1",
        );
        let mut values = vec![Value::Text(system.to_string())];
        let mut push = |clause: &str, value: Value| {
            values.push(value);
            sql.push_str(&clause.replace("{}", &format!("?{}", values.len())));
        };
        if let Some(from) = query.from {
            push(" AND created_dt >= {}", Value::Integer(to_micros(from)));
        }
        if let Some(to) = query.to {
            push(" AND created_dt <= {}", Value::Integer(to_micros(to)));
        }
        if let Some(first) = query.snapshot_from {
            push(" AND snapshot_no >= {}", Value::Integer(first));
        }
        if let Some(last) = query.snapshot_to {
            push(" AND snapshot_no <= {}", Value::Integer(last));
        }
        if let Some(namespace) = &query.namespace {
            push(" AND namespace = {}", Value::Text(namespace.clone()));
        }
        if let Some(kind) = &query.kind {
            push(" AND kind = {}", Value::Text(kind.clone()));
        }
        for (slot, label) in query.labels.filled() {
            push(&format!(" AND label{} = {{}}", slot + 1), Value::Text(label.to_string()));
        }
        if let Some(text) = &query.text {
            let pattern = format!("%{}%", text.to_lowercase());
            push(
                " AND (lower(message) LIKE {} OR lower(coalesce(data, '')) LIKE {})",
                Value::Text(pattern),
            );
        }
        sql.push_str(" ORDER BY id DESC");
        if query.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", query.limit));
        }
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let logs = stmt
                .query_map(params_from_iter(values), read_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Quick lookup
    // -------------------------------------------------------------------------

    async fn quick_get(&mut self, system: &str, key: &str) -> Result<Option<QuickEntry>> {
        let (system, key) = (system.to_string(), key.to_string());
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT key, value, updated_dt FROM quick WHERE system = ?1 AND key = ?2",
                    params![system, key],
                    |row| {
                        Ok(QuickEntry {
                            key: row.get(0)?,
                            value: row.get(1)?,
                            updated_at: timestamp_at(row, 2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn quick_set(&mut self, system: &str, entry: &QuickEntry) -> Result<()> {
        let system = system.to_string();
        let entry = entry.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO quick (system, key, value, updated_dt) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(system, key) DO UPDATE
                 SET value = excluded.value, updated_dt = excluded.updated_dt",
                params![system, entry.key, entry.value, to_micros(entry.updated_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn quick_delete(&mut self, system: &str, key: &str) -> Result<bool> {
        let (system, key) = (system.to_string(), key.to_string());
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM quick WHERE system = ?1 AND key = ?2", params![system, key])?;
            Ok(removed > 0)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    async fn insert_stat(&mut self, system: &str, record: &StatRecord) -> Result<()> {
        let system = system.to_string();
        let record = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO stats (system, created_dt, body) VALUES (?1, ?2, ?3)",
                params![system, to_micros(record.created_at), record.body],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_stats(&mut self, system: &str, limit: usize) -> Result<Vec<StatRecord>> {
        let system = system.to_string();
        let limit = if limit == 0 { -1 } else { limit as i64 };
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT created_dt, body FROM stats
                 WHERE system = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let stats = stmt
                .query_map(params![system, limit], |row| {
                    Ok(StatRecord {
                        created_at: timestamp_at(row, 0)?,
                        body: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(stats)
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Backing-Store Driver Contract
//!
//! The engine keeps its authoritative state in a relational store it does not
//! own. This module is the seam: [`BackingStore`] opens sessions, and a
//! [`StoreSession`] is one backing-store transaction with the row operations
//! the engine needs.
//!
//! ## Responsibilities of a Driver
//!
//! - Scope every row by `system` (one engine deployment)
//! - Enforce key uniqueness over live rows and report violations as
//!   [`Error::KeyConflict`](crate::Error::KeyConflict)
//! - Report lock contention as [`Error::Deadlock`](crate::Error::Deadlock) so
//!   the transaction engine can retry it
//! - Report connectivity failures as
//!   [`Error::BackingStoreUnavailable`](crate::Error::BackingStoreUnavailable)
//! - Roll back a session that is dropped without [`StoreSession::commit`]
//!
//! [`SqliteStore`](crate::sqlite::SqliteStore) is the reference
//! implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    IndexFields, LogQuery, LogRecord, ObjectFilter, QuickEntry, Snapshot, StatRecord,
    StoredObject, TxnMode, Uid,
};

/// Opens backing-store sessions.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    type Session: StoreSession;

    /// Opens a session in the given mode. Write sessions take the store's
    /// write lock up front.
    async fn begin(&self, mode: TxnMode) -> Result<Self::Session>;
}

/// One backing-store transaction.
///
/// All methods take `&mut self`: a session is owned by exactly one
/// transaction and is never shared.
#[async_trait]
pub trait StoreSession: Send {
    /// Commits. A write session that is dropped instead rolls back.
    async fn commit(&mut self) -> Result<()>;

    /// Rolls back explicitly.
    async fn rollback(&mut self) -> Result<()>;

    // -------------------------------------------------------------------------
    // Key-value table
    // -------------------------------------------------------------------------

    async fn kv_get(&mut self, system: &str, key: &str) -> Result<Option<String>>;

    async fn kv_set(&mut self, system: &str, key: &str, value: &str) -> Result<()>;

    /// All pairs whose key starts with `prefix`, ordered by key.
    async fn kv_list(&mut self, system: &str, prefix: &str) -> Result<Vec<(String, String)>>;

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    /// Fetches a row (live, deleted or archived) by Uid.
    async fn fetch_object(&mut self, system: &str, uid: &Uid) -> Result<Option<StoredObject>>;

    /// Live rows of one type/namespace holding any of the filled keys.
    async fn find_by_keys(
        &mut self,
        system: &str,
        type_name: &str,
        namespace: &str,
        keys: &IndexFields,
    ) -> Result<Vec<StoredObject>>;

    /// Live rows of one type/namespace carrying every filled label.
    async fn find_by_labels(
        &mut self,
        system: &str,
        type_name: &str,
        namespace: &str,
        labels: &IndexFields,
    ) -> Result<Vec<StoredObject>>;

    /// Bulk load of non-archived rows (live and deleted).
    async fn load_objects(&mut self, system: &str, filter: &ObjectFilter) -> Result<Vec<StoredObject>>;

    /// Inserts a new row (live or archived).
    async fn insert_object(&mut self, system: &str, row: &StoredObject) -> Result<()>;

    /// Overwrites a row if its stored version equals `expected_ver`.
    /// Returns the number of rows affected.
    async fn update_object(&mut self, system: &str, row: &StoredObject, expected_ver: i64) -> Result<u64>;

    /// Lazy-flush write: overwrites payload, `update_dt` and search blobs only
    /// where `ver == row.ver` and the stored `update_dt` is older than
    /// `row.update_dt`. Returns the number of rows affected.
    async fn update_object_if_older(&mut self, system: &str, row: &StoredObject) -> Result<u64>;

    /// Archived copies of `origin`, newest version first.
    async fn list_archives(&mut self, system: &str, origin: &Uid) -> Result<Vec<StoredObject>>;

    /// Physically removes archived rows.
    async fn delete_archives(&mut self, system: &str, uids: &[Uid]) -> Result<u64>;

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    async fn insert_snapshot(&mut self, system: &str, snapshot: &Snapshot) -> Result<()>;

    /// Most recent snapshots first.
    async fn list_snapshots(&mut self, system: &str, limit: usize) -> Result<Vec<Snapshot>>;

    // -------------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------------

    /// Appends a log record and returns its assigned id.
    async fn append_log(&mut self, system: &str, record: &LogRecord) -> Result<i64>;

    /// Matching records, newest first.
    async fn query_logs(&mut self, system: &str, query: &LogQuery) -> Result<Vec<LogRecord>>;

    // -------------------------------------------------------------------------
    // Quick lookup
    // -------------------------------------------------------------------------

    async fn quick_get(&mut self, system: &str, key: &str) -> Result<Option<QuickEntry>>;

    async fn quick_set(&mut self, system: &str, entry: &QuickEntry) -> Result<()>;

    /// Returns true if a row was removed.
    async fn quick_delete(&mut self, system: &str, key: &str) -> Result<bool>;

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    async fn insert_stat(&mut self, system: &str, record: &StatRecord) -> Result<()>;

    /// Newest first; `limit == 0` means no limit.
    async fn list_stats(&mut self, system: &str, limit: usize) -> Result<Vec<StatRecord>>;
}

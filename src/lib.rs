//! # HADB - Hybrid-Availability Data Engine
//!
//! HADB keeps versioned domain objects in a relational backing store and a
//! complete, indexed copy of them in memory. It provides:
//!
//! - **Memory-speed lookups**: by Uid, by unique key, by label, full-text scan
//! - **Versioned writes**: every update bumps `ver`, optionally archiving the
//!   previous row
//! - **Snapshots**: monotonic generation numbers tagging groups of writes
//! - **Lazy updates**: high-frequency in-memory mutations flushed in the
//!   background
//! - **Availability**: when the store is down at startup the engine serves the
//!   last local backup read-only
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Hadb<R, S>                              │
//! │          (lookups, transactions, fast updates, config)          │
//! └───────┬──────────────────────┬──────────────────────┬───────────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//! ┌───────────────┐     ┌─────────────────┐     ┌───────────────────┐
//! │ Memory Mirror │◄────│  Transactions   │     │ Lazy Update Queue │
//! │ (DataSet,     │     │ (admission,     │     │ (pending set,     │
//! │  CoW indices) │◄─┐  │  snapshots,     │     │  flush lanes)     │
//! └───────────────┘  │  │  deadlock retry)│     └─────────┬─────────┘
//!                    │  └────────┬────────┘               │
//!            ┌───────┴───────┐   │                        │
//!            │ Reload Engine │   │                        │
//!            └───────┬───────┘   │                        │
//!                    ▼           ▼                        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               BackingStore (SqliteStore reference)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Version monotonicity**: no reader ever sees an object's `ver` go
//!    backwards; every mirror mutation goes through `apply_if_newer`
//! 2. **Key uniqueness**: a key value is held by at most one live object per
//!    type and namespace, checked in memory and enforced by the store
//! 3. **Index immutability on the fast path**: fast updates never change
//!    keys or labels
//! 4. **Archive immutability**: archived copies never re-enter the live index
//!
//! ## Module Organization
//!
//! - [`error`]: Error taxonomy
//! - [`types`]: Object model, Uids, index fields, records
//! - [`config`]: Static options and dynamic config
//! - [`mirror`]: Indexed memory mirror
//! - [`store`]: Backing-store driver contract
//! - [`schema`] / [`sqlite`]: Reference SQLite driver
//! - [`txn`]: Transaction engine
//! - [`reload`]: Reload engine
//! - [`stats`]: Stat records and resource sampling
//! - [`backup`]: Local backup files
//! - [`fast_update`]: Lazy update queue
//! - [`engine`]: The [`Hadb`] handle

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for HADB operations.
pub mod error;

/// Object model: Uids, index fields, typed and untyped objects, records.
pub mod types;

/// Static engine options and the persisted dynamic config.
pub mod config;

/// The indexed in-memory mirror.
///
/// Lookups are lock-free; every mutation goes through
/// [`DataSet::apply_if_newer`](mirror::DataSet::apply_if_newer).
pub mod mirror;

/// Backing-store driver contract.
pub mod store;

/// SQLite schema for the reference driver.
pub mod schema;

/// Reference backing store over SQLite.
pub mod sqlite;

/// Transaction engine: admission control, snapshots, deadlock retry.
pub mod txn;

/// Reload engine: full and partial resynchronization, fallback.
pub mod reload;

/// Stat record bodies and host resource sampling.
pub mod stats;

/// Local backup files written after each full reload.
pub mod backup;

/// Lazy ("fast") update queue.
pub mod fast_update;

/// The engine handle.
pub mod engine;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConfigValue, DynamicConfig, EngineOptions, FastUpdateQuota, MIN_LOOP_INTERVAL_MS};
pub use engine::{EngineMetrics, Hadb};
pub use error::{Error, Result};
pub use fast_update::FlushReport;
pub use mirror::{ApplyOutcome, SearchOptions, SortField};
pub use reload::{ReloadKind, ReloadStatus};
pub use schema::Database;
pub use sqlite::{SqliteOptions, SqliteStore};
pub use stats::{ResourceMetrics, StatBody, TypeCount};
pub use store::{BackingStore, StoreSession};
pub use txn::{Txn, TxnOptions};

pub use types::{
    HadbObject, IndexFields, LogQuery, LogRecord, QuickEntry, Snapshot, StatRecord, StoredObject,
    TxnMode, Uid, UserRecord,
};

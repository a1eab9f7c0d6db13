//! # Error Handling for HADB
//!
//! This module defines the error types used throughout the engine. A single
//! error enum ([`Error`]) represents every failure mode, from a missed lookup to
//! an exhausted deadlock retry budget.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Readiness | `NotReady` | Wait for the first reload |
//! | Lookup | `NotFound` | Treat as absent |
//! | Integrity | `KeyConflict`, `Conflict`, `IndexFieldMutated` | Fix input / re-read and retry |
//! | Backpressure | `AdmissionRejected`, `QuotaExceeded` | Back off |
//! | Storage | `Deadlock`, `BackingStoreUnavailable`, `Sqlite` | Retry later, mirror stays usable |

use thiserror::Error;

use crate::types::TxnMode;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in HADB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Readiness
    // =========================================================================

    /// The engine was used before the first successful reload or backup load.
    ///
    /// # Recovery
    ///
    /// Call [`Hadb::wait_ready`](crate::Hadb::wait_ready) after starting the
    /// engine.
    #[error("engine is not ready: the memory mirror has not been loaded yet")]
    NotReady,

    // =========================================================================
    // Lookup and integrity
    // =========================================================================

    /// A Uid, key or label lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A key value is already held by another live object of the same type
    /// and namespace.
    ///
    /// # When This Happens
    ///
    /// - The in-memory key index already maps the key to a different Uid
    /// - Another write in the same transaction claimed the key
    /// - The backing store rejected the row with a uniqueness violation
    #[error("key conflict on {type_name}/{namespace}: key{column} '{key}' is already taken")]
    KeyConflict {
        /// Type name of the object being written
        type_name: String,
        /// Namespace of the object being written
        namespace: String,
        /// Key column (1-based) that collided
        column: usize,
        /// The normalized key value
        key: String,
    },

    /// A fast-update mutator changed a key or label field.
    ///
    /// Index-significant fields may only change through a write transaction.
    #[error("fast update of '{uid}' changed an indexed key or label field")]
    IndexFieldMutated {
        /// Uid of the object the mutator was applied to
        uid: String,
    },

    /// Optimistic version check failed on update or delete.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the object to get the current version
    /// 2. Re-apply the change
    /// 3. Retry the write
    #[error("version conflict on '{uid}': expected version {expected}, but found {actual}")]
    Conflict {
        /// The object being written
        uid: String,
        /// The version the caller based its change on
        expected: i64,
        /// The version currently stored
        actual: i64,
    },

    /// More than one key slot matched, and the matches are different objects.
    #[error("consistency error: {0}")]
    Consistency(String),

    // =========================================================================
    // Backpressure
    // =========================================================================

    /// The concurrent-transaction ceiling for this mode was reached.
    ///
    /// This is a backpressure signal, not a queue: the caller is expected to
    /// back off and try again.
    #[error("too many concurrent {mode} transactions ({scope} limit {limit})")]
    AdmissionRejected {
        /// Read or write
        mode: TxnMode,
        /// `"global"` or the client key that hit its ceiling
        scope: String,
        /// The configured ceiling
        limit: usize,
    },

    /// A fast-update or log-based quota rejected the operation.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    // =========================================================================
    // Storage
    // =========================================================================

    /// The backing store reported a deadlock (or lock timeout).
    ///
    /// Inside a transaction runner this is retried with backoff; it only
    /// reaches the caller once the retry budget is exhausted.
    #[error("deadlock after {attempts} attempt(s): {message}")]
    Deadlock {
        /// How many times the transaction body was attempted
        attempts: u32,
        /// Driver message of the last deadlock
        message: String,
    },

    /// The backing store could not be reached or a query failed.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// A write was attempted on a read transaction, or while the engine is
    /// serving from a local backup.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// The operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// A nested body failed inside this transaction, so it cannot commit.
    /// Also available to bodies that want to abort with a reason.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute lets `?` convert rusqlite errors automatically.
    /// Driver code classifies busy/locked and constraint errors before they
    /// reach this variant.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Local backup file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or backup (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the backing store classified this error as a deadlock.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Deadlock { .. })
    }

    /// Returns true if the error says nothing about the data itself, only
    /// about the backing store being unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::BackingStoreUnavailable(_) | Error::Sqlite(_) | Error::Deadlock { .. }
        )
    }

    /// Returns true if the same operation may succeed when tried again later
    /// without any change by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Deadlock { .. } | Error::AdmissionRejected { .. } | Error::BackingStoreUnavailable(_)
        )
    }

    /// Builds a [`Error::Deadlock`] for a single driver-level occurrence.
    pub fn deadlock(message: impl Into<String>) -> Self {
        Error::Deadlock {
            attempts: 1,
            message: message.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

//! # Object Model for HADB
//!
//! This module defines the value types shared by every layer of the engine:
//! object identity, versioning, key/label fields, snapshots and the auxiliary
//! records (logs, quick-lookup rows, statistics) that live next to objects in
//! the backing store.
//!
//! ## Two Shapes of an Object
//!
//! ```text
//! ┌───────────────────────────┐   to_stored()    ┌───────────────────────────┐
//! │      HadbObject<R>        │ ───────────────► │       StoredObject        │
//! │  typed user_data: R       │                  │  payload: JSON string     │
//! │  (mirror, transactions)   │ ◄─────────────── │  (driver, backup file)    │
//! └───────────────────────────┘   from_stored()  └───────────────────────────┘
//! ```
//!
//! The driver never needs to know the user record type; it moves
//! [`StoredObject`] rows. The engine converts at the boundary.
//!
//! ## Invariants
//!
//! - `ver` starts at 1 and strictly increases on every update or delete
//! - `update_dt` strictly increases on every mutation, including fast updates
//! - Empty key/label slots never participate in indexing
//! - Archived copies never re-enter the live index

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of key slots and label slots carried by every object.
pub const MAX_INDEX_FIELDS: usize = 5;

/// Timestamp type used for every `*_dt` field.
pub type Timestamp = DateTime<Utc>;

// =============================================================================
// Identity
// =============================================================================

/// Globally unique, immutable object identifier.
///
/// Uids are type-prefixed (`"Host-3f2a..."`) so a raw id in a log line already
/// says what kind of object it names. Archived copies get a derived Uid built
/// from the origin Uid and the archived version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Generates a fresh Uid with the given type prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple()))
    }

    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derived Uid of the archived copy of `origin` at version `ver`.
    pub fn archive_of(origin: &Uid, ver: i64) -> Self {
        Self(format!("{}~v{}", origin.0, ver))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnMode {
    Read,
    Write,
}

impl fmt::Display for TxnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnMode::Read => write!(f, "read"),
            TxnMode::Write => write!(f, "write"),
        }
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalizes a key or label value.
///
/// - Surrounding whitespace is trimmed
/// - Empty values become `None` (the slot is unused)
/// - IP literals are rewritten to their canonical form (`::FFFF:1.2.3.4`
///   and `::ffff:1.2.3.4` index identically)
/// - Everything else is lower-cased, making key comparison case-insensitive
pub fn normalize_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    Some(trimmed.to_lowercase())
}

/// Case-insensitive key equality after normalization.
pub fn keys_equal(a: &str, b: &str) -> bool {
    normalize_key(a) == normalize_key(b)
}

/// Normalizes a full-text search blob: lower-cased, whitespace collapsed.
pub fn normalize_search_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}

// =============================================================================
// Key / Label Fields
// =============================================================================

/// Five optional, normalized index slots.
///
/// Used for both keys (unique per column, type and namespace) and labels
/// (non-unique). Values are always stored normalized, so two `IndexFields`
/// compare equal exactly when they index identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexFields([Option<String>; MAX_INDEX_FIELDS]);

impl IndexFields {
    /// All slots empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds fields from up to five raw values; extra values are ignored.
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fields = Self::default();
        for (slot, value) in values.into_iter().take(MAX_INDEX_FIELDS).enumerate() {
            fields.0[slot] = normalize_key(value.as_ref());
        }
        fields
    }

    /// Builds fields from explicit optional slots.
    pub fn from_slots(slots: [Option<&str>; MAX_INDEX_FIELDS]) -> Self {
        let mut fields = Self::default();
        for (slot, value) in slots.iter().enumerate() {
            fields.0[slot] = value.and_then(normalize_key);
        }
        fields
    }

    /// Sets one slot (0-based), normalizing the value.
    pub fn set(&mut self, slot: usize, value: Option<&str>) {
        if slot < MAX_INDEX_FIELDS {
            self.0[slot] = value.and_then(normalize_key);
        }
    }

    /// Returns the value of one slot (0-based).
    pub fn get(&self, slot: usize) -> Option<&str> {
        self.0.get(slot).and_then(|v| v.as_deref())
    }

    /// Iterates over filled slots as `(slot, value)`.
    pub fn filled(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(slot, v)| v.as_deref().map(|v| (slot, v)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Raw slot access for drivers.
    pub fn slots(&self) -> &[Option<String>; MAX_INDEX_FIELDS] {
        &self.0
    }
}

// =============================================================================
// User Record Capability
// =============================================================================

/// The domain record stored inside an object.
///
/// A concrete domain implements this once. An engine serving several domain
/// types uses an enum with a serde tag, so the payload carries its own type tag
/// through the backing store and backup file.
///
/// # Example
///
/// ```rust
/// use hadb::types::{IndexFields, UserRecord};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, PartialEq, Serialize, Deserialize)]
/// struct Host { name: String, owner: String, notes: String }
///
/// impl UserRecord for Host {
///     fn type_name(&self) -> &str { "Host" }
///     fn keys(&self) -> IndexFields { IndexFields::new([&self.name]) }
///     fn labels(&self) -> IndexFields { IndexFields::new([&self.owner]) }
///     fn max_archive_count(&self) -> usize { 3 }
/// }
/// ```
pub trait UserRecord:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Type name used for indexing and partitioning.
    fn type_name(&self) -> &str;

    /// Unique key fields. Defaults to none.
    fn keys(&self) -> IndexFields {
        IndexFields::empty()
    }

    /// Non-unique label fields. Defaults to none.
    fn labels(&self) -> IndexFields {
        IndexFields::empty()
    }

    /// Canonicalizes the record before it is written.
    fn normalize(&mut self) {}

    /// How many archived versions to retain. Zero disables archiving.
    fn max_archive_count(&self) -> usize {
        0
    }

    /// Source text for the two full-text search blobs.
    fn search_text(&self) -> (Option<String>, Option<String>) {
        (None, None)
    }
}

// =============================================================================
// Objects
// =============================================================================

/// A typed object as held by the memory mirror and transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HadbObject<R> {
    pub uid: Uid,
    pub type_name: String,
    pub namespace: String,
    pub ver: i64,
    pub deleted: bool,
    pub archive: bool,
    pub snapshot_no: i64,
    pub create_dt: Timestamp,
    pub update_dt: Timestamp,
    pub delete_dt: Option<Timestamp>,
    pub keys: IndexFields,
    pub labels: IndexFields,
    pub ext1: Option<String>,
    pub ext2: Option<String>,
    pub search1: Option<String>,
    pub search2: Option<String>,
    pub user_data: R,
}

impl<R: UserRecord> HadbObject<R> {
    /// A new, not yet stored object. Version, snapshot and timestamps are
    /// assigned when a write transaction inserts it.
    pub fn new(namespace: impl Into<String>, user_data: R) -> Self {
        let ts = now();
        let mut obj = Self {
            uid: Uid::generate(user_data.type_name()),
            type_name: String::new(),
            namespace: namespace.into(),
            ver: 0,
            deleted: false,
            archive: false,
            snapshot_no: 0,
            create_dt: ts,
            update_dt: ts,
            delete_dt: None,
            keys: IndexFields::empty(),
            labels: IndexFields::empty(),
            ext1: None,
            ext2: None,
            search1: None,
            search2: None,
            user_data,
        };
        obj.refresh_derived(false);
        obj
    }

    /// Sets the two free-text extension fields.
    pub fn with_ext(mut self, ext1: Option<String>, ext2: Option<String>) -> Self {
        self.ext1 = ext1;
        self.ext2 = ext2;
        self
    }

    /// Live objects participate in key and label indexing.
    pub fn is_live(&self) -> bool {
        !self.deleted && !self.archive
    }

    /// Recomputes the derived fields (keys, labels, search blobs) from the
    /// user record.
    pub fn refresh_derived(&mut self, full_text: bool) {
        self.user_data.normalize();
        self.type_name = self.user_data.type_name().to_string();
        self.keys = self.user_data.keys();
        self.labels = self.user_data.labels();
        self.refresh_search(full_text);
    }

    /// Recomputes only the search blobs.
    pub fn refresh_search(&mut self, full_text: bool) {
        if full_text {
            let (a, b) = self.user_data.search_text();
            self.search1 = a.as_deref().and_then(normalize_search_text);
            self.search2 = b.as_deref().and_then(normalize_search_text);
        } else {
            self.search1 = None;
            self.search2 = None;
        }
    }

    /// Converts to the untyped row shape used by drivers and backups.
    pub fn to_stored(&self) -> Result<StoredObject> {
        Ok(StoredObject {
            uid: self.uid.clone(),
            origin_uid: None,
            type_name: self.type_name.clone(),
            namespace: self.namespace.clone(),
            ver: self.ver,
            deleted: self.deleted,
            archive: self.archive,
            snapshot_no: self.snapshot_no,
            create_dt: self.create_dt,
            update_dt: self.update_dt,
            delete_dt: self.delete_dt,
            keys: self.keys.clone(),
            labels: self.labels.clone(),
            ext1: self.ext1.clone(),
            ext2: self.ext2.clone(),
            search1: self.search1.clone(),
            search2: self.search2.clone(),
            payload: serde_json::to_string(&self.user_data)?,
        })
    }

    /// Decodes an untyped row.
    pub fn from_stored(row: &StoredObject) -> Result<Self> {
        let user_data: R = serde_json::from_str(&row.payload)?;
        Ok(Self {
            uid: row.uid.clone(),
            type_name: row.type_name.clone(),
            namespace: row.namespace.clone(),
            ver: row.ver,
            deleted: row.deleted,
            archive: row.archive,
            snapshot_no: row.snapshot_no,
            create_dt: row.create_dt,
            update_dt: row.update_dt,
            delete_dt: row.delete_dt,
            keys: row.keys.clone(),
            labels: row.labels.clone(),
            ext1: row.ext1.clone(),
            ext2: row.ext2.clone(),
            search1: row.search1.clone(),
            search2: row.search2.clone(),
            user_data,
        })
    }
}

/// Untyped object row: what drivers persist and backups serialize.
///
/// `payload` is the serialized user record. For archived copies,
/// `origin_uid` names the live object the copy was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub uid: Uid,
    pub origin_uid: Option<Uid>,
    pub type_name: String,
    pub namespace: String,
    pub ver: i64,
    pub deleted: bool,
    pub archive: bool,
    pub snapshot_no: i64,
    pub create_dt: Timestamp,
    pub update_dt: Timestamp,
    pub delete_dt: Option<Timestamp>,
    pub keys: IndexFields,
    pub labels: IndexFields,
    pub ext1: Option<String>,
    pub ext2: Option<String>,
    pub search1: Option<String>,
    pub search2: Option<String>,
    pub payload: String,
}

impl StoredObject {
    /// Builds the archived copy of this row. Key uniqueness only covers live
    /// rows, so the copy keeps its keys for audit.
    pub fn to_archive(&self) -> StoredObject {
        let mut copy = self.clone();
        copy.uid = Uid::archive_of(&self.uid, self.ver);
        copy.origin_uid = Some(self.uid.clone());
        copy.archive = true;
        copy
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// An immutable generation marker cut by write transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub uid: Uid,
    pub number: i64,
    pub created_at: Timestamp,
    pub description: String,
}

// =============================================================================
// Auxiliary Records
// =============================================================================

/// Append-only log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Assigned by the driver on insert; zero before that.
    pub id: i64,
    pub created_at: Timestamp,
    pub snapshot_no: i64,
    pub namespace: String,
    pub kind: String,
    pub labels: IndexFields,
    pub message: String,
    pub data: Option<String>,
}

impl LogRecord {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            created_at: now(),
            snapshot_no: 0,
            namespace: namespace.into(),
            kind: kind.into(),
            labels: IndexFields::empty(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_labels(mut self, labels: IndexFields) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Log query predicate. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub snapshot_from: Option<i64>,
    pub snapshot_to: Option<i64>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    /// Every filled slot must match the record's slot.
    pub labels: IndexFields,
    /// Case-insensitive substring match on message and data.
    pub text: Option<String>,
    /// Newest first; zero means no limit.
    pub limit: usize,
}

/// Row of the quick-lookup store: a simpler parallel table for high-churn
/// key→blob data that does not need versioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub updated_at: Timestamp,
}

/// Periodic statistics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub created_at: Timestamp,
    pub body: String,
}

/// Row filter for bulk object loads.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    /// Only rows with `update_dt >= updated_since`.
    pub updated_since: Option<Timestamp>,
    /// Only rows of this type.
    pub type_name: Option<String>,
}

// =============================================================================
// Time Helpers
// =============================================================================

/// Current wall-clock time, at the microsecond precision drivers store.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}

/// Next `update_dt` for an object whose previous value was `prev`.
///
/// Strictly greater than `prev` even when the clock has not advanced (or went
/// backwards), which the conditional flush guard relies on.
pub fn next_update_dt(prev: Timestamp) -> Timestamp {
    let now = now();
    let floor = prev + ChronoDuration::microseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

/// Timestamp → microseconds since the epoch (driver storage format).
pub fn to_micros(ts: Timestamp) -> i64 {
    ts.timestamp_micros()
}

/// Microseconds since the epoch → timestamp.
pub fn from_micros(micros: i64) -> Result<Timestamp> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| Error::Consistency(format!("timestamp out of range: {micros}")))
}

// =============================================================================
// Tests
// =============================================================================

//! # Transaction Engine
//!
//! A transaction is a scoped unit of work against the backing store. The
//! engine wraps a driver session with everything the store itself does not
//! know about: admission limits, snapshot numbering, the in-memory key check,
//! archiving, and merging results into the memory mirror.
//!
//! ## Lifecycle
//!
//! ```text
//! admit ──► begin session ──► allocate snapshot ──► body ──► commit ──► merge
//!   │            │              (write only)          │         │          │
//!   │            │                                    │         │          └─ apply_if_newer
//!   │            └── Deadlock ◄───────────────────────┴─────────┘             for every touched
//!   │                   │                                                     object
//!   │                   └─► backoff, retry whole body (bounded)
//!   └─► AdmissionRejected (fail fast, never queued)
//! ```
//!
//! ## Rust Pattern: Closure Bodies Returning Boxed Futures
//!
//! A transaction body borrows the transaction mutably and may be run more than
//! once (deadlock retry). That is expressed as
//!
//! ```text
//! F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>>
//! ```
//!
//! Each call produces a fresh future tied to the borrow of the transaction.
//! Bodies capture owned (cloned) data and use `async move { ... }.boxed()`.
//!
//! ```rust,no_run
//! # use hadb::{Hadb, SqliteStore, TxnOptions, UserRecord, IndexFields};
//! # use futures::FutureExt;
//! # #[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! # struct Host { name: String }
//! # impl UserRecord for Host {
//! #     fn type_name(&self) -> &str { "Host" }
//! #     fn keys(&self) -> IndexFields { IndexFields::new([&self.name]) }
//! # }
//! # async fn demo(hadb: Hadb<Host, SqliteStore>) -> hadb::Result<()> {
//! let created = hadb
//!     .write(TxnOptions::new(), |txn| {
//!         async move { txn.add("default", Host { name: "web-1".into() }).await }.boxed()
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DynamicConfig;
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::store::{BackingStore, StoreSession};
use crate::types::{
    from_micros, next_update_dt, now, to_micros, HadbObject, IndexFields, LogQuery, LogRecord,
    QuickEntry, Snapshot, StoredObject, TxnMode, Uid, UserRecord,
};

/// Key-value entries holding the snapshot counter.
pub(crate) const SNAPSHOT_NO_KEY: &str = "snapshot.no";
pub(crate) const SNAPSHOT_UID_KEY: &str = "snapshot.uid";
pub(crate) const SNAPSHOT_DT_KEY: &str = "snapshot.dt";

// =============================================================================
// Options
// =============================================================================

/// Per-transaction options.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Identifies the caller for per-client admission limits.
    pub client_key: Option<String>,
    /// Force a new snapshot at the start of a write transaction.
    pub take_snapshot: bool,
    /// Aborts the transaction (no commit, no merge) when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl TxnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    pub fn with_snapshot(mut self) -> Self {
        self.take_snapshot = true;
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

// =============================================================================
// Admission Control
// =============================================================================

/// Concurrent-transaction counters, global and per client key.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    read: AtomicUsize,
    write: AtomicUsize,
    clients: DashMap<(TxnMode, String), usize>,
}

impl Admission {
    fn counter(&self, mode: TxnMode) -> &AtomicUsize {
        match mode {
            TxnMode::Read => &self.read,
            TxnMode::Write => &self.write,
        }
    }

    /// Transactions of `mode` currently admitted.
    pub(crate) fn in_flight(&self, mode: TxnMode) -> usize {
        self.counter(mode).load(Ordering::Acquire)
    }

    /// Takes a slot or fails immediately with [`Error::AdmissionRejected`].
    pub(crate) fn admit(
        self: &Arc<Self>,
        mode: TxnMode,
        client: Option<&str>,
        config: &DynamicConfig,
    ) -> Result<Permit> {
        let write = mode == TxnMode::Write;
        let counter = self.counter(mode);

        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = config.global_limit(write) {
            if previous >= limit {
                counter.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::AdmissionRejected {
                    mode,
                    scope: "global".to_string(),
                    limit,
                });
            }
        }

        if let Some(client) = client {
            let mut entry = self.clients.entry((mode, client.to_string())).or_insert(0);
            if let Some(limit) = config.client_limit(write) {
                if *entry >= limit {
                    drop(entry);
                    counter.fetch_sub(1, Ordering::AcqRel);
                    return Err(Error::AdmissionRejected {
                        mode,
                        scope: format!("client '{client}'"),
                        limit,
                    });
                }
            }
            *entry += 1;
        }

        Ok(Permit {
            admission: Arc::clone(self),
            mode,
            client: client.map(str::to_string),
        })
    }
}

/// An admitted transaction slot, released on drop.
#[derive(Debug)]
pub(crate) struct Permit {
    admission: Arc<Admission>,
    mode: TxnMode,
    client: Option<String>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.admission.counter(self.mode).fetch_sub(1, Ordering::AcqRel);
        if let Some(client) = self.client.take() {
            let key = (self.mode, client);
            if let Some(mut count) = self.admission.clients.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
            self.admission.clients.remove_if(&key, |_, count| *count == 0);
        }
    }
}

// =============================================================================
// Snapshot Allocation
// =============================================================================

async fn read_snapshot_no<Sess: StoreSession>(session: &mut Sess, system: &str) -> Result<i64> {
    match session.kv_get(system, SNAPSHOT_NO_KEY).await? {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Consistency(format!("invalid snapshot number '{raw}'"))),
        None => Ok(0),
    }
}

/// Returns the snapshot number a write transaction tags its rows with,
/// cutting a new snapshot when one is due.
async fn allocate_snapshot<Sess: StoreSession>(
    session: &mut Sess,
    system: &str,
    forced: bool,
    config: &DynamicConfig,
) -> Result<i64> {
    let number = read_snapshot_no(session, system).await?;
    let last_cut = match session.kv_get(system, SNAPSHOT_DT_KEY).await? {
        Some(raw) => {
            let micros: i64 = raw
                .parse()
                .map_err(|_| Error::Consistency(format!("invalid snapshot timestamp '{raw}'")))?;
            Some(from_micros(micros)?)
        }
        None => None,
    };

    let interval_elapsed = match (config.auto_snapshot_interval(), last_cut) {
        (Some(interval), Some(at)) => (now() - at).to_std().map_or(false, |age| age >= interval),
        (Some(_), None) => true,
        (None, _) => false,
    };
    if number != 0 && !forced && !interval_elapsed {
        return Ok(number);
    }

    let snapshot = Snapshot {
        uid: Uid::generate("Snapshot"),
        number: number + 1,
        created_at: now(),
        description: if forced { "requested" } else { "automatic" }.to_string(),
    };
    session
        .kv_set(system, SNAPSHOT_NO_KEY, &snapshot.number.to_string())
        .await?;
    session.kv_set(system, SNAPSHOT_UID_KEY, snapshot.uid.as_str()).await?;
    session
        .kv_set(system, SNAPSHOT_DT_KEY, &to_micros(snapshot.created_at).to_string())
        .await?;
    session.insert_snapshot(system, &snapshot).await?;
    info!(system, snapshot = snapshot.number, forced, "cut new snapshot");
    Ok(snapshot.number)
}

// =============================================================================
// Transaction
// =============================================================================

/// An open transaction.
///
/// Obtained either inside a body passed to [`Hadb::read`](crate::Hadb::read) /
/// [`Hadb::write`](crate::Hadb::write), or explicitly from
/// [`Hadb::begin`](crate::Hadb::begin). Dropping an uncommitted transaction
/// rolls it back and merges nothing.
pub struct Txn<R: UserRecord, S: BackingStore> {
    shared: Arc<Shared<R, S>>,
    session: S::Session,
    mode: TxnMode,
    snapshot_no: i64,
    /// Every object written or fetched, latest version per Uid.
    touched: HashMap<Uid, Arc<HadbObject<R>>>,
    /// Set when a nested body failed; commit is refused.
    aborted: Option<String>,
    _permit: Option<Permit>,
}

impl<R: UserRecord, S: BackingStore> Txn<R, S> {
    pub(crate) async fn open(
        shared: Arc<Shared<R, S>>,
        mode: TxnMode,
        take_snapshot: bool,
        permit: Option<Permit>,
    ) -> Result<Self> {
        if !shared.mirror.is_loaded() {
            return Err(Error::NotReady);
        }
        if mode == TxnMode::Write && shared.is_degraded() {
            return Err(Error::ReadOnly(
                "engine is serving from its local backup".to_string(),
            ));
        }

        let mut session = shared.store.begin(mode).await?;
        let system = shared.options.system_name.clone();
        let snapshot_no = match mode {
            TxnMode::Write => {
                let config = shared.config.current();
                allocate_snapshot(&mut session, &system, take_snapshot, &config).await?
            }
            TxnMode::Read => read_snapshot_no(&mut session, &system).await?,
        };

        Ok(Self {
            shared,
            session,
            mode,
            snapshot_no,
            touched: HashMap::new(),
            aborted: None,
            _permit: permit,
        })
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Snapshot number this transaction's writes are tagged with.
    pub fn snapshot_no(&self) -> i64 {
        self.snapshot_no
    }

    fn system(&self) -> &str {
        &self.shared.options.system_name
    }

    fn require_write(&self, operation: &str) -> Result<()> {
        if self.mode == TxnMode::Write {
            Ok(())
        } else {
            Err(Error::ReadOnly(format!("{operation} requires a write transaction")))
        }
    }

    /// Remembers `obj` for the post-commit merge, keeping the newest version.
    fn record(&mut self, obj: HadbObject<R>) -> HadbObject<R> {
        let keep = match self.touched.get(&obj.uid) {
            Some(existing) => crate::mirror::is_newer(&obj, existing),
            None => true,
        };
        if keep {
            self.touched.insert(obj.uid.clone(), Arc::new(obj.clone()));
        }
        obj
    }

    fn decode(&mut self, row: &StoredObject) -> Result<HadbObject<R>> {
        let obj = HadbObject::from_stored(row)?;
        Ok(self.record(obj))
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetches an object (live or deleted) from the backing store.
    pub async fn get(&mut self, uid: &Uid) -> Result<Option<HadbObject<R>>> {
        let system = self.system().to_string();
        match self.session.fetch_object(&system, uid).await? {
            Some(row) if !row.archive => Ok(Some(self.decode(&row)?)),
            _ => Ok(None),
        }
    }

    /// Like [`Txn::get`], but a miss is [`Error::NotFound`].
    pub async fn get_required(&mut self, uid: &Uid) -> Result<HadbObject<R>> {
        self.get(uid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("object '{uid}'")))
    }

    /// The live object holding any of the filled keys.
    pub async fn find_by_key(
        &mut self,
        type_name: &str,
        namespace: &str,
        keys: &IndexFields,
    ) -> Result<Option<HadbObject<R>>> {
        let system = self.system().to_string();
        let rows = self
            .session
            .find_by_keys(&system, type_name, namespace, keys)
            .await?;
        if rows.len() > 1 {
            return Err(Error::Consistency(format!(
                "keys of {type_name}/{namespace} resolve to {} different objects",
                rows.len()
            )));
        }
        match rows.first() {
            Some(row) => Ok(Some(self.decode(row)?)),
            None => Ok(None),
        }
    }

    /// Live objects carrying every filled label.
    pub async fn find_by_labels(
        &mut self,
        type_name: &str,
        namespace: &str,
        labels: &IndexFields,
    ) -> Result<Vec<HadbObject<R>>> {
        let system = self.system().to_string();
        let rows = self
            .session
            .find_by_labels(&system, type_name, namespace, labels)
            .await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Archived versions of an object, newest first.
    pub async fn archives(&mut self, uid: &Uid) -> Result<Vec<HadbObject<R>>> {
        let system = self.system().to_string();
        let rows = self.session.list_archives(&system, uid).await?;
        rows.iter().map(HadbObject::from_stored).collect()
    }

    /// Most recent snapshots, newest first. Zero means all.
    pub async fn snapshots(&mut self, limit: usize) -> Result<Vec<Snapshot>> {
        let system = self.system().to_string();
        self.session.list_snapshots(&system, limit).await
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Creates a new object from a user record.
    pub async fn add(&mut self, namespace: &str, record: R) -> Result<HadbObject<R>> {
        self.insert(HadbObject::new(namespace, record)).await
    }

    /// Stores a caller-built object as version 1.
    ///
    /// The Uid, namespace and extension fields are taken from `obj`; version,
    /// snapshot, timestamps and derived fields are assigned here.
    pub async fn insert(&mut self, mut obj: HadbObject<R>) -> Result<HadbObject<R>> {
        self.require_write("insert")?;
        let ts = now();
        obj.ver = 1;
        obj.deleted = false;
        obj.archive = false;
        obj.snapshot_no = self.snapshot_no;
        obj.create_dt = ts;
        obj.update_dt = ts;
        obj.delete_dt = None;
        obj.refresh_derived(self.shared.options.full_text_search);
        self.check_keys(&obj)?;

        let system = self.system().to_string();
        self.session.insert_object(&system, &obj.to_stored()?).await?;
        debug!(uid = %obj.uid, snapshot = self.snapshot_no, "inserted object");
        Ok(self.record(obj))
    }

    /// Writes a modified object. `obj.ver` must be the version the change was
    /// based on; the stored object gets `ver + 1`.
    pub async fn update(&mut self, mut obj: HadbObject<R>) -> Result<HadbObject<R>> {
        self.require_write("update")?;
        let current = self.current_row(&obj.uid, obj.ver).await?;
        let previous: HadbObject<R> = HadbObject::from_stored(&current)?;

        obj.refresh_derived(self.shared.options.full_text_search);
        if obj.type_name != current.type_name {
            return Err(Error::Consistency(format!(
                "'{}' cannot change type from {} to {}",
                obj.uid, current.type_name, obj.type_name
            )));
        }
        obj.namespace = current.namespace.clone();
        obj.create_dt = current.create_dt;
        obj.ver = current.ver + 1;
        obj.update_dt = next_update_dt(current.update_dt);
        obj.snapshot_no = self.snapshot_no;
        obj.deleted = false;
        obj.archive = false;
        obj.delete_dt = None;
        self.check_keys(&obj)?;

        self.archive_previous(&current, previous.user_data.max_archive_count())
            .await?;
        self.write_row(&obj.to_stored()?, current.ver).await?;
        debug!(uid = %obj.uid, ver = obj.ver, "updated object");
        Ok(self.record(obj))
    }

    /// Loads, mutates and writes an object in one step.
    pub async fn update_with<F>(&mut self, uid: &Uid, mutate: F) -> Result<HadbObject<R>>
    where
        F: FnOnce(&mut R) + Send,
    {
        let mut obj = self.get_required(uid).await?;
        mutate(&mut obj.user_data);
        self.update(obj).await
    }

    /// Marks an object deleted. `obj.ver` must be the current version.
    pub async fn delete(&mut self, obj: &HadbObject<R>) -> Result<HadbObject<R>> {
        self.require_write("delete")?;
        let current = self.current_row(&obj.uid, obj.ver).await?;
        let mut deleted: HadbObject<R> = HadbObject::from_stored(&current)?;
        let max_archive = deleted.user_data.max_archive_count();

        let ts = next_update_dt(current.update_dt);
        deleted.ver = current.ver + 1;
        deleted.deleted = true;
        deleted.delete_dt = Some(ts);
        deleted.update_dt = ts;
        deleted.snapshot_no = self.snapshot_no;

        self.archive_previous(&current, max_archive).await?;
        self.write_row(&deleted.to_stored()?, current.ver).await?;
        debug!(uid = %deleted.uid, ver = deleted.ver, "deleted object");
        Ok(self.record(deleted))
    }

    /// Fetches the stored row an update or delete is based on.
    async fn current_row(&mut self, uid: &Uid, expected_ver: i64) -> Result<StoredObject> {
        let system = self.system().to_string();
        let current = self
            .session
            .fetch_object(&system, uid)
            .await?
            .filter(|row| !row.archive)
            .ok_or_else(|| Error::NotFound(format!("object '{uid}'")))?;
        if current.deleted {
            return Err(Error::NotFound(format!("object '{uid}' is deleted")));
        }
        if current.ver != expected_ver {
            return Err(Error::Conflict {
                uid: uid.to_string(),
                expected: expected_ver,
                actual: current.ver,
            });
        }
        Ok(current)
    }

    async fn write_row(&mut self, row: &StoredObject, expected_ver: i64) -> Result<()> {
        let system = self.system().to_string();
        if self.session.update_object(&system, row, expected_ver).await? == 0 {
            return Err(Error::Conflict {
                uid: row.uid.to_string(),
                expected: expected_ver,
                actual: row.ver,
            });
        }
        Ok(())
    }

    /// Stores the prior row as an archived copy and trims old copies.
    async fn archive_previous(&mut self, current: &StoredObject, max_archive: usize) -> Result<()> {
        if max_archive == 0 {
            return Ok(());
        }
        let system = self.system().to_string();
        self.session
            .insert_object(&system, &current.to_archive())
            .await?;

        let archives = self.session.list_archives(&system, &current.uid).await?;
        if archives.len() > max_archive {
            let expired: Vec<Uid> = archives[max_archive..]
                .iter()
                .map(|a| a.uid.clone())
                .collect();
            let removed = self.session.delete_archives(&system, &expired).await?;
            debug!(uid = %current.uid, removed, "trimmed archived versions");
        }
        Ok(())
    }

    /// In-memory key uniqueness check. The backing store's unique index is
    /// the authoritative backstop.
    fn check_keys(&self, obj: &HadbObject<R>) -> Result<()> {
        let data = self.shared.mirror.data();
        for (slot, value) in obj.keys.filled() {
            let holds = |other: &HadbObject<R>| {
                other.uid != obj.uid
                    && other.is_live()
                    && other.type_name == obj.type_name
                    && other.namespace == obj.namespace
                    && other.keys.get(slot) == Some(value)
            };
            let conflict = || Error::KeyConflict {
                type_name: obj.type_name.clone(),
                namespace: obj.namespace.clone(),
                column: slot + 1,
                key: value.to_string(),
            };

            // Objects seen by this transaction are fresher than the mirror.
            if self.touched.values().any(|t| holds(t.as_ref())) {
                return Err(conflict());
            }
            let mut lookup = IndexFields::empty();
            lookup.set(slot, Some(value));
            if let Some(holder) = data.search_by_key(&lookup, &obj.type_name, &obj.namespace)? {
                let released = self
                    .touched
                    .get(&holder.uid)
                    .map_or(false, |seen| !holds(seen.as_ref()));
                if holds(holder.as_ref()) && !released {
                    return Err(conflict());
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Key-value table
    // -------------------------------------------------------------------------

    pub async fn kv_get(&mut self, key: &str) -> Result<Option<String>> {
        let system = self.system().to_string();
        self.session.kv_get(&system, key).await
    }

    pub async fn kv_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.require_write("kv_set")?;
        let system = self.system().to_string();
        self.session.kv_set(&system, key, value).await
    }

    // -------------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------------

    /// Appends a log record tagged with this transaction's snapshot.
    pub async fn append_log(&mut self, mut record: LogRecord) -> Result<i64> {
        self.require_write("append_log")?;
        record.snapshot_no = self.snapshot_no;
        let system = self.system().to_string();
        self.session.append_log(&system, &record).await
    }

    pub async fn query_logs(&mut self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let system = self.system().to_string();
        self.session.query_logs(&system, query).await
    }

    /// Fails with [`Error::QuotaExceeded`] if `max` or more log records match
    /// `query`. Returns the number of matches otherwise.
    pub async fn check_log_quota(&mut self, query: &LogQuery, max: usize) -> Result<usize> {
        let bounded = LogQuery {
            limit: max.saturating_add(1),
            ..query.clone()
        };
        let matched = self.query_logs(&bounded).await?.len();
        if matched >= max {
            return Err(Error::QuotaExceeded(format!(
                "{matched} matching log records, limit {max}"
            )));
        }
        Ok(matched)
    }

    // -------------------------------------------------------------------------
    // Quick lookup
    // -------------------------------------------------------------------------

    pub async fn quick_get(&mut self, key: &str) -> Result<Option<QuickEntry>> {
        let system = self.system().to_string();
        self.session.quick_get(&system, key).await
    }

    pub async fn quick_set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.require_write("quick_set")?;
        let system = self.system().to_string();
        let entry = QuickEntry {
            key: key.to_string(),
            value,
            updated_at: now(),
        };
        self.session.quick_set(&system, &entry).await
    }

    pub async fn quick_delete(&mut self, key: &str) -> Result<bool> {
        self.require_write("quick_delete")?;
        let system = self.system().to_string();
        self.session.quick_delete(&system, key).await
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Commits and merges every touched object into the memory mirror.
    ///
    /// For read transactions this ends the session and merges the fetched
    /// rows, which keeps the mirror self-healing on pure reads.
    pub async fn commit(mut self) -> Result<()> {
        self.complete().await
    }

    /// Rolls back explicitly. Nothing is merged.
    pub async fn rollback(mut self) -> Result<()> {
        self.touched.clear();
        self.session.rollback().await
    }

    pub(crate) async fn complete(&mut self) -> Result<()> {
        if let Some(reason) = self.aborted.take() {
            self.abort().await;
            return Err(Error::Aborted(reason));
        }
        self.session.commit().await?;
        let mirror = &self.shared.mirror;
        for (_, obj) in self.touched.drain() {
            mirror.apply_if_newer(obj);
        }
        if self.mode == TxnMode::Write {
            self.shared.metrics.record_commit();
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.touched.clear();
        if let Err(e) = self.session.rollback().await {
            debug!(error = %e, "rollback after failed body");
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Awaits `fut` unless `token` fires first.
pub(crate) async fn with_cancel<T>(
    token: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}

/// Backoff before deadlock retry number `attempt` (1-based):
/// `avg × attempt`, capped at the configured maximum, plus up to `avg` jitter.
pub(crate) fn deadlock_backoff(config: &DynamicConfig, attempt: u32) -> Duration {
    let avg = config.deadlock_avg_interval();
    let base = avg.saturating_mul(attempt).min(config.deadlock_max_interval());
    let jitter_ms = rand::thread_rng().gen_range(0..=avg.as_millis() as u64);
    base + Duration::from_millis(jitter_ms)
}

/// Runs `body` in a new transaction with admission control and deadlock
/// retry.
pub(crate) async fn run<R, S, T, F>(
    shared: &Arc<Shared<R, S>>,
    mode: TxnMode,
    options: TxnOptions,
    mut body: F,
) -> Result<T>
where
    R: UserRecord,
    S: BackingStore,
    T: Send,
    F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>> + Send,
{
    let config = shared.config.current();
    let _permit = match shared
        .admission
        .admit(mode, options.client_key.as_deref(), &config)
    {
        Ok(permit) => permit,
        Err(e) => {
            shared.metrics.record_rejection();
            return Err(e);
        }
    };

    let max_attempts = config.deadlock_retry_count.max(0) as u32 + 1;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match run_once(shared, mode, &options, &mut body).await {
            Err(Error::Deadlock { message, .. }) => {
                shared.metrics.record_deadlock();
                if attempt >= max_attempts {
                    warn!(attempts = attempt, %message, "deadlock retries exhausted");
                    return Err(Error::Deadlock {
                        attempts: attempt,
                        message,
                    });
                }
                let delay = deadlock_backoff(&config, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, %message, "deadlock, retrying transaction");
                with_cancel(options.cancel.as_ref(), async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
            other => return other,
        }
    }
}

async fn run_once<R, S, T, F>(
    shared: &Arc<Shared<R, S>>,
    mode: TxnMode,
    options: &TxnOptions,
    body: &mut F,
) -> Result<T>
where
    R: UserRecord,
    S: BackingStore,
    T: Send,
    F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>> + Send,
{
    let cancel = options.cancel.as_ref();
    let mut txn = with_cancel(
        cancel,
        Txn::open(Arc::clone(shared), mode, options.take_snapshot, None),
    )
    .await?;

    let outcome = with_cancel(cancel, body(&mut txn)).await;
    match outcome {
        Ok(value) => {
            txn.complete().await?;
            Ok(value)
        }
        Err(e) => {
            txn.abort().await;
            Err(e)
        }
    }
}

/// Runs `body` inside `outer` when given, otherwise in a new write
/// transaction.
///
/// A failing nested body marks `outer` aborted: even if the caller swallows
/// the error, committing `outer` then fails with [`Error::Aborted`].
pub(crate) async fn run_nested<R, S, T, F>(
    shared: &Arc<Shared<R, S>>,
    outer: Option<&mut Txn<R, S>>,
    options: TxnOptions,
    mut body: F,
) -> Result<T>
where
    R: UserRecord,
    S: BackingStore,
    T: Send,
    F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>> + Send,
{
    match outer {
        Some(txn) => {
            if txn.mode != TxnMode::Write {
                return Err(Error::ReadOnly(
                    "nested transactions require a write transaction".to_string(),
                ));
            }
            let result = body(&mut *txn).await;
            if let Err(e) = &result {
                txn.aborted.get_or_insert_with(|| e.to_string());
            }
            result
        }
        None => run(shared, TxnMode::Write, options, body).await,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(global: i64, per_client: i64) -> DynamicConfig {
        DynamicConfig {
            max_write_txns: global,
            max_write_txns_per_client: per_client,
            ..DynamicConfig::default()
        }
    }

    #[test]
    fn global_ceiling_rejects_and_recovers() {
        let admission = Arc::new(Admission::default());
        let config = limits(2, 0);

        let a = admission.admit(TxnMode::Write, None, &config).unwrap();
        let _b = admission.admit(TxnMode::Write, None, &config).unwrap();
        let err = admission.admit(TxnMode::Write, None, &config).unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { limit: 2, .. }));

        // Reads have their own ceiling.
        let _r = admission.admit(TxnMode::Read, None, &config).unwrap();

        drop(a);
        assert_eq!(admission.in_flight(TxnMode::Write), 1);
        let _c = admission.admit(TxnMode::Write, None, &config).unwrap();
    }

    #[test]
    fn client_ceiling_is_per_key() {
        let admission = Arc::new(Admission::default());
        let config = limits(0, 1);

        let held = admission.admit(TxnMode::Write, Some("alice"), &config).unwrap();
        let err = admission
            .admit(TxnMode::Write, Some("alice"), &config)
            .unwrap_err();
        match err {
            Error::AdmissionRejected { scope, .. } => assert_eq!(scope, "client 'alice'"),
            other => panic!("unexpected error: {other:?}"),
        }
        let _bob = admission.admit(TxnMode::Write, Some("bob"), &config).unwrap();

        // A rejected client attempt must not leak a global slot.
        assert_eq!(admission.in_flight(TxnMode::Write), 2);

        drop(held);
        assert!(admission.clients.get(&(TxnMode::Write, "alice".to_string())).is_none());
        let _again = admission.admit(TxnMode::Write, Some("alice"), &config).unwrap();
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = DynamicConfig {
            deadlock_retry_avg_interval_ms: 10,
            deadlock_retry_max_interval_ms: 25,
            ..DynamicConfig::default()
        };
        let first = deadlock_backoff(&config, 1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(20));

        let late = deadlock_backoff(&config, 10);
        assert!(late >= Duration::from_millis(25) && late <= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = with_cancel(Some(&token), std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}

//! # The HADB Engine Handle
//!
//! [`Hadb`] ties the pieces together: one memory mirror, one backing store,
//! the transaction engine, and two supervised background loops.
//!
//! ## Lifecycle
//!
//! ```text
//!   Hadb::new ──► start ──► wait_ready ──► ... use ... ──► dispose
//!                   │                                        │
//!                   ├─ reload loop  (full / partial)         ├─ cancel both loops
//!                   └─ flush loop   (lazy updates)           ├─ join them
//!                                                            └─ final flush
//! ```
//!
//! Until the first full reload (or backup load) has populated the mirror,
//! every lookup and transaction fails with [`Error::NotReady`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Hadb<R, S> (Clone)                           │
//! │                                                                       │
//! │   Arc<Shared<R, S>>                                                   │
//! │   ┌───────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────┐  │
//! │   │ Mirror<R>     │  │ ConfigHub    │  │ Admission    │  │ Pending │  │
//! │   │ (lock-free    │  │ (ArcSwap +   │  │ (atomic      │  │ Queue   │  │
//! │   │  lookups)     │  │  watch)      │  │  counters)   │  │         │  │
//! │   └───────▲───────┘  └──────────────┘  └──────────────┘  └────▲────┘  │
//! │           │ apply_if_newer                                    │       │
//! │   ┌───────┴─────────────┐   ┌──────────────┐   ┌──────────────┴────┐  │
//! │   │ transactions        │   │ reload loop  │   │ flush loop        │  │
//! │   │ (caller tasks)      │   │ (tokio task) │   │ (tokio task)      │  │
//! │   └───────┬─────────────┘   └──────┬───────┘   └──────────┬────────┘  │
//! └───────────┼────────────────────────┼──────────────────────┼───────────┘
//!             └────────────────────────┼──────────────────────┘
//!                                      ▼
//!                              ┌───────────────┐
//!                              │ BackingStore  │
//!                              └───────────────┘
//! ```
//!
//! ## Rust Concepts
//!
//! - **`Arc<Shared>`**: every clone of the handle and both background tasks
//!   share one state block
//! - **`CancellationToken`**: cooperative shutdown of the background loops
//! - **`watch` channel**: readiness is published by the reload loop and
//!   awaited by [`Hadb::wait_ready`]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::BackupFiles;
use crate::config::{self, ConfigHub, ConfigValue, DynamicConfig, EngineOptions, CONFIG_KEY_PREFIX};
use crate::error::{Error, Result};
use crate::fast_update::{self, FlushReport, PendingQueue};
use crate::mirror::{DataSet, Mirror, SearchOptions};
use crate::reload::{self, ReloadKind, ReloadState, ReloadStatus};
use crate::store::{BackingStore, StoreSession};
use crate::txn::{self, with_cancel, Admission, Txn, TxnOptions};
use crate::types::{HadbObject, IndexFields, TxnMode, Uid, UserRecord};

// =============================================================================
// Metrics
// =============================================================================

/// Engine-wide counters, updated lock-free from every path.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    commits: AtomicU64,
    rejections: AtomicU64,
    deadlocks: AtomicU64,
    fast_updates: AtomicU64,
    throttled: AtomicU64,
    flushed: AtomicU64,
    requeued: AtomicU64,
    superseded: AtomicU64,
    flush_failures: AtomicU64,
    full_reloads: AtomicU64,
    partial_reloads: AtomicU64,
    reload_failures: AtomicU64,
    backup_loads: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Metrics {
    pub(crate) fn record_commit(&self) {
        bump(&self.commits, 1);
    }

    pub(crate) fn record_rejection(&self) {
        bump(&self.rejections, 1);
    }

    pub(crate) fn record_deadlock(&self) {
        bump(&self.deadlocks, 1);
    }

    pub(crate) fn record_fast_update(&self) {
        bump(&self.fast_updates, 1);
    }

    pub(crate) fn record_throttled(&self) {
        bump(&self.throttled, 1);
    }

    pub(crate) fn record_flush(&self, report: &FlushReport) {
        bump(&self.flushed, report.flushed as u64);
        bump(&self.requeued, report.requeued as u64);
        bump(&self.superseded, report.superseded as u64);
        bump(&self.flush_failures, report.failed as u64);
    }

    pub(crate) fn record_reload(&self, kind: ReloadKind) {
        match kind {
            ReloadKind::Full => bump(&self.full_reloads, 1),
            ReloadKind::Partial => bump(&self.partial_reloads, 1),
        }
    }

    pub(crate) fn record_reload_failure(&self) {
        bump(&self.reload_failures, 1);
    }

    pub(crate) fn record_backup_load(&self) {
        bump(&self.backup_loads, 1);
    }
}

/// Point-in-time view of the engine's counters and state.
///
/// Also the body of persisted stat records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub loaded: bool,
    pub degraded: bool,
    pub objects: usize,
    pub pending_fast_updates: usize,
    pub in_flight_reads: usize,
    pub in_flight_writes: usize,
    pub commits: u64,
    pub admission_rejections: u64,
    pub deadlocks: u64,
    pub fast_updates: u64,
    pub fast_updates_throttled: u64,
    pub flushed: u64,
    pub flush_requeued: u64,
    pub flush_superseded: u64,
    pub flush_failures: u64,
    pub full_reloads: u64,
    pub partial_reloads: u64,
    pub reload_failures: u64,
    pub backup_loads: u64,
    pub maintenance_message: String,
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared by every handle clone and both background loops.
pub(crate) struct Shared<R: UserRecord, S: BackingStore> {
    pub(crate) options: EngineOptions,
    pub(crate) store: S,
    pub(crate) mirror: Mirror<R>,
    pub(crate) config: ConfigHub,
    pub(crate) admission: Arc<Admission>,
    pub(crate) queue: PendingQueue<R>,
    pub(crate) metrics: Metrics,
    pub(crate) reload: Mutex<ReloadState>,
    /// Held for a whole reload cycle.
    pub(crate) reload_gate: tokio::sync::Mutex<()>,
    /// Serving from the local backup; writes are refused.
    pub(crate) degraded: AtomicBool,
    pub(crate) status: watch::Sender<ReloadStatus>,
    pub(crate) backup: Option<BackupFiles>,
}

impl<R: UserRecord, S: BackingStore> Shared<R, S> {
    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn metrics_snapshot(&self) -> EngineMetrics {
        let m = &self.metrics;
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineMetrics {
            loaded: self.mirror.is_loaded(),
            degraded: self.is_degraded(),
            objects: self.mirror.data().len(),
            pending_fast_updates: self.queue.len(),
            in_flight_reads: self.admission.in_flight(TxnMode::Read),
            in_flight_writes: self.admission.in_flight(TxnMode::Write),
            commits: get(&m.commits),
            admission_rejections: get(&m.rejections),
            deadlocks: get(&m.deadlocks),
            fast_updates: get(&m.fast_updates),
            fast_updates_throttled: get(&m.throttled),
            flushed: get(&m.flushed),
            flush_requeued: get(&m.requeued),
            flush_superseded: get(&m.superseded),
            flush_failures: get(&m.flush_failures),
            full_reloads: get(&m.full_reloads),
            partial_reloads: get(&m.partial_reloads),
            reload_failures: get(&m.reload_failures),
            backup_loads: get(&m.backup_loads),
            maintenance_message: self.config.current().maintenance_message.clone(),
        }
    }
}

/// Background loop bookkeeping.
struct Background {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

// =============================================================================
// Hadb - The Engine Handle
// =============================================================================

/// The engine handle.
///
/// `Hadb` is `Clone`; all clones share one mirror, one backing store and one
/// pair of background loops.
///
/// # Example
///
/// ```rust,no_run
/// use futures::FutureExt;
/// use hadb::{EngineOptions, Hadb, IndexFields, SqliteStore, TxnOptions, UserRecord};
///
/// #[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// struct Host {
///     name: String,
///     last_seen: i64,
/// }
///
/// impl UserRecord for Host {
///     fn type_name(&self) -> &str {
///         "Host"
///     }
///     fn keys(&self) -> IndexFields {
///         IndexFields::new([&self.name])
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> hadb::Result<()> {
///     let store = SqliteStore::open("hosts.db")?;
///     let hadb: Hadb<Host, _> = Hadb::new(store, EngineOptions::new("inventory"));
///     hadb.start();
///     hadb.wait_ready(5).await?;
///
///     let host = hadb
///         .write(TxnOptions::new(), |txn| {
///             async move { txn.add("default", Host { name: "web-1".into(), last_seen: 0 }).await }
///                 .boxed()
///         })
///         .await?;
///
///     hadb.fast_update(&host.uid, |h| {
///         h.last_seen = 42;
///         true
///     })?;
///
///     hadb.dispose().await;
///     Ok(())
/// }
/// ```
pub struct Hadb<R: UserRecord, S: BackingStore> {
    shared: Arc<Shared<R, S>>,
    background: Arc<Background>,
}

impl<R: UserRecord, S: BackingStore> Clone for Hadb<R, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            background: Arc::clone(&self.background),
        }
    }
}

impl<R: UserRecord, S: BackingStore> Hadb<R, S> {
    /// Creates an engine over `store`. Nothing runs until [`Hadb::start`].
    pub fn new(store: S, options: EngineOptions) -> Self {
        let backup = options
            .backup_dir
            .as_ref()
            .map(|dir| BackupFiles::new(dir, &options.system_name));
        let (status, _) = watch::channel(ReloadStatus::default());
        let shared = Shared {
            config: ConfigHub::new(options.initial_config.clone()),
            options,
            store,
            mirror: Mirror::new(),
            admission: Arc::new(Admission::default()),
            queue: PendingQueue::new(),
            metrics: Metrics::default(),
            reload: Mutex::new(ReloadState::default()),
            reload_gate: tokio::sync::Mutex::new(()),
            degraded: AtomicBool::new(false),
            status,
            backup,
        };
        Self {
            shared: Arc::new(shared),
            background: Arc::new(Background {
                cancel: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the reload and flush loops on the current Tokio runtime.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self) {
        if self.background.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let reload = tokio::spawn(reload::run_reload_loop(
            Arc::clone(&self.shared),
            self.background.cancel.child_token(),
        ));
        let flush = tokio::spawn(fast_update::run_flush_loop(
            Arc::clone(&self.shared),
            self.background.cancel.child_token(),
        ));
        self.background.handles.lock().extend([reload, flush]);
        info!(system = %self.shared.options.system_name, "engine started");
    }

    /// Waits until the mirror is populated.
    ///
    /// Returns [`Error::BackingStoreUnavailable`] carrying the last reload
    /// error once `max_attempts` consecutive reload cycles have failed without
    /// any data to serve. Requires [`Hadb::start`].
    pub async fn wait_ready(&self, max_attempts: u32) -> Result<()> {
        let max_attempts = max_attempts.max(1);
        let mut rx = self.shared.status.subscribe();
        let status = rx
            .wait_for(|s| s.loaded || s.failures >= max_attempts)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::BackingStoreUnavailable("engine was disposed".to_string()))?;
        if status.loaded {
            Ok(())
        } else {
            Err(Error::BackingStoreUnavailable(
                status.last_error.unwrap_or_else(|| "reload failed".to_string()),
            ))
        }
    }

    /// Has the mirror been populated?
    pub fn is_ready(&self) -> bool {
        self.shared.mirror.is_loaded()
    }

    /// Is the engine serving from its local backup (read-only)?
    pub fn is_degraded(&self) -> bool {
        self.shared.is_degraded()
    }

    /// Latest reload outcome.
    pub fn reload_status(&self) -> ReloadStatus {
        self.shared.status.borrow().clone()
    }

    /// Stops both loops, waits for them, then flushes pending fast updates
    /// one last time.
    pub async fn dispose(&self) {
        self.background.cancel.cancel();
        let handles = std::mem::take(&mut *self.background.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }

        if self.shared.mirror.is_loaded() && !self.shared.is_degraded() && self.shared.queue.len() > 0 {
            let report = fast_update::flush_pending(&self.shared).await;
            info!(
                flushed = report.flushed,
                failed = report.failed,
                "final flush of pending fast updates"
            );
        }
        info!(system = %self.shared.options.system_name, "engine disposed");
    }

    // -------------------------------------------------------------------------
    // Memory lookups
    // -------------------------------------------------------------------------

    fn data(&self) -> Result<Arc<DataSet<R>>> {
        if !self.shared.mirror.is_loaded() {
            return Err(Error::NotReady);
        }
        Ok(self.shared.mirror.data())
    }

    /// Point lookup by Uid. Deleted objects are returned too.
    pub fn get(&self, uid: &Uid) -> Result<Option<Arc<HadbObject<R>>>> {
        Ok(self.data()?.get(uid))
    }

    /// Point lookup by Uid, constrained to a type and namespace.
    pub fn get_typed(&self, uid: &Uid, type_name: &str, namespace: &str) -> Result<Option<Arc<HadbObject<R>>>> {
        Ok(self.data()?.get_typed(uid, type_name, namespace))
    }

    /// Like [`Hadb::get`], but a miss is [`Error::NotFound`].
    pub fn get_required(&self, uid: &Uid) -> Result<Arc<HadbObject<R>>> {
        self.get(uid)?
            .ok_or_else(|| Error::NotFound(format!("object '{uid}'")))
    }

    /// The live object holding any of the filled keys.
    pub fn search_by_key(
        &self,
        keys: &IndexFields,
        type_name: &str,
        namespace: &str,
    ) -> Result<Option<Arc<HadbObject<R>>>> {
        self.data()?.search_by_key(keys, type_name, namespace)
    }

    /// Live objects carrying every filled label.
    pub fn search_by_labels(
        &self,
        labels: &IndexFields,
        type_name: &str,
        namespace: &str,
    ) -> Result<Vec<Arc<HadbObject<R>>>> {
        Ok(self.data()?.search_by_labels(labels, type_name, namespace))
    }

    /// Scans the search blobs of one type and namespace.
    pub fn full_text_search(
        &self,
        type_name: &str,
        namespace: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Arc<HadbObject<R>>>> {
        Ok(self.data()?.full_text_search(type_name, namespace, query, options))
    }

    /// Live object counts per `(type, namespace)`.
    pub fn counts(&self) -> Result<BTreeMap<(String, String), usize>> {
        Ok(self.data()?.counts())
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Runs `body` in a read transaction. Fetched rows are merged into the
    /// mirror when the body succeeds.
    pub async fn read<T, F>(&self, options: TxnOptions, body: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>> + Send,
    {
        txn::run(&self.shared, TxnMode::Read, options, body).await
    }

    /// Runs `body` in a write transaction with deadlock retry.
    pub async fn write<T, F>(&self, options: TxnOptions, body: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>> + Send,
    {
        txn::run(&self.shared, TxnMode::Write, options, body).await
    }

    /// Runs `body` inside `outer` if given, otherwise in a fresh write
    /// transaction.
    ///
    /// ```rust,no_run
    /// # use futures::FutureExt;
    /// # use hadb::{Hadb, SqliteStore, Txn, TxnOptions, UserRecord, IndexFields};
    /// # #[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    /// # struct Host { name: String }
    /// # impl UserRecord for Host {
    /// #     fn type_name(&self) -> &str { "Host" }
    /// #     fn keys(&self) -> IndexFields { IndexFields::new([&self.name]) }
    /// # }
    /// async fn register(
    ///     hadb: &Hadb<Host, SqliteStore>,
    ///     outer: Option<&mut Txn<Host, SqliteStore>>,
    ///     name: String,
    /// ) -> hadb::Result<()> {
    ///     hadb.write_in(outer, TxnOptions::new(), |txn| {
    ///         let name = name.clone();
    ///         async move { txn.add("default", Host { name }).await.map(|_| ()) }.boxed()
    ///     })
    ///     .await
    /// }
    /// ```
    pub async fn write_in<T, F>(&self, outer: Option<&mut Txn<R, S>>, options: TxnOptions, body: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Txn<R, S>) -> BoxFuture<'t, Result<T>> + Send,
    {
        txn::run_nested(&self.shared, outer, options, body).await
    }

    /// Opens a transaction the caller drives by hand.
    ///
    /// The admission slot is held until the transaction is committed, rolled
    /// back or dropped. No deadlock retry is applied.
    pub async fn begin(&self, mode: TxnMode, options: TxnOptions) -> Result<Txn<R, S>> {
        let config = self.shared.config.current();
        let permit = self
            .shared
            .admission
            .admit(mode, options.client_key.as_deref(), &config)
            .map_err(|e| {
                self.shared.metrics.record_rejection();
                e
            })?;
        with_cancel(
            options.cancel.as_ref(),
            Txn::open(Arc::clone(&self.shared), mode, options.take_snapshot, Some(permit)),
        )
        .await
    }

    /// Forces a new snapshot and returns its number.
    pub async fn take_snapshot(&self) -> Result<i64> {
        self.write(TxnOptions::new().with_snapshot(), |txn| {
            let number = txn.snapshot_no();
            async move { Ok(number) }.boxed()
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Fast updates
    // -------------------------------------------------------------------------

    /// Mutates a non-indexed part of an object in memory and queues the
    /// result for a background write.
    ///
    /// `mutate` returns `false` for "no change". Changing a key or label
    /// field fails with [`Error::IndexFieldMutated`] and leaves the object
    /// untouched.
    pub fn fast_update<F>(&self, uid: &Uid, mutate: F) -> Result<Arc<HadbObject<R>>>
    where
        F: FnOnce(&mut R) -> bool,
    {
        fast_update::fast_update(&self.shared, uid, mutate)
    }

    /// Flushes pending fast updates now instead of waiting for the loop.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        if self.shared.is_degraded() {
            return Err(Error::ReadOnly(
                "engine is serving from its local backup".to_string(),
            ));
        }
        Ok(fast_update::flush_pending(&self.shared).await)
    }

    // -------------------------------------------------------------------------
    // Reload, config, metrics
    // -------------------------------------------------------------------------

    /// Runs one reload cycle now. `full` forces a full reload.
    pub async fn reload_now(&self, full: bool) -> Result<ReloadKind> {
        reload::reload_once(&self.shared, full).await
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.shared.metrics_snapshot()
    }

    /// The effective dynamic config.
    pub fn config(&self) -> Arc<DynamicConfig> {
        self.shared.config.current()
    }

    /// Notified whenever the effective dynamic config changes.
    pub fn subscribe_config(&self) -> watch::Receiver<Arc<DynamicConfig>> {
        self.shared.config.subscribe()
    }

    /// Persists one dynamic config value and applies it locally.
    ///
    /// Other engines sharing the backing store pick it up on their next
    /// reload cycle.
    pub async fn set_config(&self, name: &str, value: ConfigValue) -> Result<()> {
        let field = config::field(name)
            .ok_or_else(|| Error::Config(format!("unknown config field '{name}'")))?;
        if self.shared.is_degraded() {
            return Err(Error::ReadOnly(
                "engine is serving from its local backup".to_string(),
            ));
        }

        let mut next = DynamicConfig::clone(&self.shared.config.current());
        field.assign(&mut next, value)?;
        let raw = serde_json::to_string(&(field.get)(&next))?;

        let system = self.shared.options.system_name.as_str();
        let mut session = self.shared.store.begin(TxnMode::Write).await?;
        session
            .kv_set(system, &format!("{CONFIG_KEY_PREFIX}{name}"), &raw)
            .await?;
        session.commit().await?;

        if self.shared.config.apply(next) {
            info!(field = name, value = %raw, "dynamic config updated");
        }
        Ok(())
    }
}

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use hadb::{
    BackingStore, DynamicConfig, EngineOptions, Error, Hadb, HadbObject, IndexFields, Result,
    SqliteOptions, SqliteStore, StoreSession, StoredObject, TxnMode, TxnOptions, Uid, UserRecord,
};

pub const SYSTEM: &str = "test";
pub const NS: &str = "default";

// =============================================================================
// Sample Record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub alias: Option<String>,
    pub owner: String,
    pub zone: String,
    pub notes: String,
    pub hits: u64,
}

impl Host {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alias: None,
            owner: "ops".to_string(),
            zone: "eu".to_string(),
            notes: String::new(),
            hits: 0,
        }
    }
}

impl UserRecord for Host {
    fn type_name(&self) -> &str {
        "Host"
    }

    fn keys(&self) -> IndexFields {
        IndexFields::from_slots([Some(self.name.as_str()), self.alias.as_deref(), None, None, None])
    }

    fn labels(&self) -> IndexFields {
        IndexFields::new([&self.owner, &self.zone])
    }

    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
    }

    fn max_archive_count(&self) -> usize {
        3
    }

    fn search_text(&self) -> (Option<String>, Option<String>) {
        (Some(self.name.clone()), Some(self.notes.clone()))
    }
}

// =============================================================================
// Stores
// =============================================================================

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hadb=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn create_temp_store(name: &str) -> (tempfile::TempDir, SqliteStore) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let store = open_store(&dir.path().join(name));
    (dir, store)
}

pub fn open_store(path: &Path) -> SqliteStore {
    SqliteStore::open_with(
        path,
        SqliteOptions {
            busy_timeout: Duration::from_millis(200),
            ..SqliteOptions::default()
        },
    )
    .expect("open sqlite store")
}

/// Short intervals so background loops act within a test's lifetime.
pub fn fast_config() -> DynamicConfig {
    DynamicConfig {
        partial_reload_interval_ms: 50,
        partial_reload_shift_ms: 1_000,
        reload_retry_interval_ms: 20,
        fast_update_flush_interval_ms: 50,
        deadlock_retry_avg_interval_ms: 2,
        deadlock_retry_max_interval_ms: 10,
        ..DynamicConfig::default()
    }
}

pub fn test_options() -> EngineOptions {
    EngineOptions {
        full_text_search: true,
        initial_config: fast_config(),
        ..EngineOptions::new(SYSTEM)
    }
}

/// An engine populated by one explicit full reload, with no background loops.
pub async fn loaded_engine<S: BackingStore>(store: S, options: EngineOptions) -> Hadb<Host, S> {
    let hadb = Hadb::new(store, options);
    hadb.reload_now(true).await.expect("initial full reload");
    hadb
}

/// Reads a row straight from the store, bypassing the engine.
pub async fn stored_row(store: &SqliteStore, uid: &Uid) -> Option<StoredObject> {
    let mut session = store.begin(TxnMode::Read).await.expect("begin read");
    let row = session.fetch_object(SYSTEM, uid).await.expect("fetch row");
    session.commit().await.expect("commit read");
    row
}

pub async fn add_host<S: BackingStore>(hadb: &Hadb<Host, S>, host: Host) -> Result<HadbObject<Host>> {
    hadb.write(TxnOptions::new(), |txn| {
        let host = host.clone();
        async move { txn.add(NS, host).await }.boxed()
    })
    .await
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Fault Injection
// =============================================================================

/// Wraps a store and can take it offline or make the next write sessions
/// fail with a deadlock.
#[derive(Clone)]
pub struct FlakyStore<S> {
    inner: S,
    pub offline: Arc<AtomicBool>,
    pub deadlocks: Arc<AtomicUsize>,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            offline: Arc::new(AtomicBool::new(false)),
            deadlocks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn inject_deadlocks(&self, count: usize) {
        self.deadlocks.store(count, Ordering::SeqCst);
    }

    pub fn remaining_deadlocks(&self) -> usize {
        self.deadlocks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: BackingStore + Clone> BackingStore for FlakyStore<S> {
    type Session = S::Session;

    async fn begin(&self, mode: TxnMode) -> Result<Self::Session> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::BackingStoreUnavailable("store is offline".to_string()));
        }
        if mode == TxnMode::Write
            && self
                .deadlocks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::deadlock("injected deadlock"));
        }
        self.inner.begin(mode).await
    }
}

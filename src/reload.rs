//! # Reload Engine
//!
//! Keeps the memory mirror in step with the backing store, which other
//! engines write to as well.
//!
//! ## States
//!
//! ```text
//!            start                     interval elapsed
//! Stopped ─────────► FullReload ──────────────────────────┐
//!                        │  ▲                             │
//!                        ▼  │ full interval / degraded    │
//!                     Steady: PartialReload ◄─────────────┘
//!                        │
//!                        │ cancel
//!                        ▼
//!                     Stopped
//! ```
//!
//! ## Full Reload
//!
//! Builds a fresh [`DataSet`] from every non-archived row, hands the old data
//! set over to it (see [`DataSet::hand_over`]), carries pending fast updates
//! over, and only then swaps it in. Afterwards the local backup files are
//! rewritten. Cycles never overlap: the loop and `reload_now` share a gate.
//!
//! ## Partial Reload
//!
//! Fetches rows with `update_dt >= last_start - shift`. Types with a
//! staleness threshold get their own, wider window:
//!
//! ```text
//!   window(type) = last_start - max(threshold(type), shift)
//! ```
//!
//! Everything is merged with `apply_if_newer`, so applying the same result
//! twice changes nothing.
//!
//! ## Fallback
//!
//! If a cycle fails before the mirror was ever populated, the engine loads
//! its local backup instead and marks itself degraded (read-only). Full
//! reloads continue in the background until the store is back.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::BackupFiles;
use crate::config::{DynamicConfig, CONFIG_KEY_PREFIX};
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::mirror::{ApplyOutcome, DataSet};
use crate::stats::{collect_resource_metrics, StatBody, TypeCount};
use crate::store::{BackingStore, StoreSession};
use crate::types::{now, HadbObject, ObjectFilter, StatRecord, StoredObject, Timestamp, TxnMode, UserRecord};

// =============================================================================
// State
// =============================================================================

/// Which kind of cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    Full,
    Partial,
}

/// Published after every cycle; [`Hadb::wait_ready`](crate::Hadb::wait_ready)
/// waits on it.
#[derive(Debug, Clone, Default)]
pub struct ReloadStatus {
    /// The mirror holds data (from the store or from the backup).
    pub loaded: bool,
    pub degraded: bool,
    /// Consecutive failed cycles.
    pub failures: u32,
    pub last_error: Option<String>,
    pub last_kind: Option<ReloadKind>,
}

/// Bookkeeping owned by the reload loop.
#[derive(Debug, Default)]
pub(crate) struct ReloadState {
    last_full: Option<Instant>,
    /// Wall-clock start of the last successful cycle.
    last_start: Option<Timestamp>,
    last_stat: Option<Instant>,
}

// =============================================================================
// Loop
// =============================================================================

/// Delay before the next cycle: 0.8–1.2× the partial interval after success,
/// 0.5–1.5× the retry interval after failure.
pub(crate) fn next_delay(config: &DynamicConfig, succeeded: bool) -> Duration {
    let (base, low, high) = if succeeded {
        (config.partial_reload_interval(), 0.8, 1.2)
    } else {
        (config.reload_retry_interval(), 0.5, 1.5)
    };
    base.mul_f64(rand::thread_rng().gen_range(low..=high))
}

/// Background reload loop. Runs until `cancel` fires.
pub(crate) async fn run_reload_loop<R, S>(shared: Arc<Shared<R, S>>, cancel: CancellationToken)
where
    R: UserRecord,
    S: BackingStore,
{
    info!(system = %shared.options.system_name, "reload loop started");
    loop {
        let succeeded = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = reload_once(&shared, false) => result.is_ok(),
        };
        let delay = next_delay(&shared.config.current(), succeeded);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!(system = %shared.options.system_name, "reload loop stopped");
}

/// Runs one cycle: full if forced or due, partial otherwise.
pub(crate) async fn reload_once<R, S>(shared: &Shared<R, S>, force_full: bool) -> Result<ReloadKind>
where
    R: UserRecord,
    S: BackingStore,
{
    let _gate = shared.reload_gate.lock().await;
    let config = shared.config.current();
    let full_due = force_full
        || !shared.mirror.is_loaded()
        || shared.is_degraded()
        || shared
            .reload
            .lock()
            .last_full
            .map_or(true, |at| at.elapsed() >= config.full_reload_interval());
    let kind = if full_due {
        ReloadKind::Full
    } else {
        ReloadKind::Partial
    };

    let result = match kind {
        ReloadKind::Full => full_reload(shared).await,
        ReloadKind::Partial => partial_reload(shared, &config).await,
    };

    match result {
        Ok(()) => {
            shared.metrics.record_reload(kind);
            shared.status.send_modify(|status| {
                status.loaded = true;
                status.degraded = shared.is_degraded();
                status.failures = 0;
                status.last_error = None;
                status.last_kind = Some(kind);
            });
            Ok(kind)
        }
        Err(e) => {
            shared.metrics.record_reload_failure();
            warn!(?kind, error = %e, "reload failed");
            if !shared.mirror.is_loaded() {
                fall_back(shared).await;
            }
            let message = e.to_string();
            shared.status.send_modify(|status| {
                status.loaded = shared.mirror.is_loaded();
                status.degraded = shared.is_degraded();
                status.failures = status.failures.saturating_add(1);
                status.last_error = Some(message);
            });
            Err(e)
        }
    }
}

// =============================================================================
// Full Reload
// =============================================================================

async fn full_reload<R, S>(shared: &Shared<R, S>) -> Result<()>
where
    R: UserRecord,
    S: BackingStore,
{
    let started = Instant::now();
    let started_at = now();
    let system = shared.options.system_name.as_str();

    let mut session = shared.store.begin(TxnMode::Read).await?;
    let rows = session.load_objects(system, &ObjectFilter::default()).await?;
    let persisted = session.kv_list(system, CONFIG_KEY_PREFIX).await?;
    session.commit().await?;

    let data = Arc::new(DataSet::new());
    let mut skipped = 0usize;
    for row in &rows {
        match HadbObject::<R>::from_stored(row) {
            Ok(obj) => {
                data.apply_if_newer(Arc::new(obj));
            }
            Err(e) => {
                skipped += 1;
                warn!(uid = %row.uid, error = %e, "skipping undecodable row");
            }
        }
    }

    // Hand over before install: anything a reader could see in the old set
    // must already be in the new one. Backup contents are not carried.
    let was_degraded = shared.is_degraded();
    shared.mirror.data().hand_over(&data, !was_degraded);
    shared.queue.relink(&data);
    shared.mirror.install(data);

    {
        let mut state = shared.reload.lock();
        state.last_full = Some(started);
        state.last_start = Some(started_at);
    }
    if shared.degraded.swap(false, Ordering::AcqRel) {
        info!(system, "backing store reachable again, leaving degraded mode");
    }
    info!(
        system,
        objects = rows.len(),
        skipped,
        pending = shared.queue.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "full reload finished"
    );

    refresh_config(shared, persisted).await;
    persist_stats(shared).await;
    save_backup(shared, rows).await;
    Ok(())
}

// =============================================================================
// Partial Reload
// =============================================================================

/// Row filters for one partial reload starting from `since`.
pub(crate) fn partial_filters(config: &DynamicConfig, since: Timestamp) -> Vec<ObjectFilter> {
    let shift = config.partial_reload_shift();
    let window = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());

    let mut filters = vec![ObjectFilter {
        updated_since: Some(since - window(shift)),
        type_name: None,
    }];
    for (type_name, threshold) in config.staleness_thresholds() {
        if threshold > shift {
            filters.push(ObjectFilter {
                updated_since: Some(since - window(threshold)),
                type_name: Some(type_name),
            });
        }
    }
    filters
}

async fn partial_reload<R, S>(shared: &Shared<R, S>, config: &DynamicConfig) -> Result<()>
where
    R: UserRecord,
    S: BackingStore,
{
    let started_at = now();
    let since = shared.reload.lock().last_start.unwrap_or(started_at);
    let system = shared.options.system_name.as_str();

    let mut session = shared.store.begin(TxnMode::Read).await?;
    let mut rows = Vec::new();
    for filter in partial_filters(config, since) {
        rows.extend(session.load_objects(system, &filter).await?);
    }
    let persisted = session.kv_list(system, CONFIG_KEY_PREFIX).await?;
    session.commit().await?;

    let data = shared.mirror.data();
    let mut changed = 0usize;
    for row in &rows {
        match HadbObject::<R>::from_stored(row) {
            Ok(obj) => {
                if data.apply_if_newer(Arc::new(obj)) != ApplyOutcome::Ignored {
                    changed += 1;
                }
            }
            Err(e) => warn!(uid = %row.uid, error = %e, "skipping undecodable row"),
        }
    }

    shared.reload.lock().last_start = Some(started_at);
    debug!(system, fetched = rows.len(), changed, "partial reload finished");

    refresh_config(shared, persisted).await;
    Ok(())
}

// =============================================================================
// Dynamic Config Refresh
// =============================================================================

/// Merges the persisted config onto the defaults, publishes changes and
/// writes missing keys back.
async fn refresh_config<R, S>(shared: &Shared<R, S>, persisted: Vec<(String, String)>)
where
    R: UserRecord,
    S: BackingStore,
{
    let persisted: BTreeMap<String, String> = persisted
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(CONFIG_KEY_PREFIX)
                .map(|name| (name.to_string(), value))
        })
        .collect();

    let outcome = DynamicConfig::merge(&shared.options.initial_config, &persisted);
    for problem in &outcome.invalid {
        warn!(%problem, "invalid persisted config value, using default");
    }
    if shared.config.apply(outcome.config) {
        info!(system = %shared.options.system_name, "dynamic config changed");
    }

    if outcome.missing.is_empty() || shared.is_degraded() {
        return;
    }
    let backfilled = outcome.missing.len();
    if let Err(e) = backfill_config(shared, outcome.missing).await {
        warn!(error = %e, "could not write default config values back");
    } else {
        debug!(backfilled, "wrote default config values back");
    }
}

async fn backfill_config<R, S>(
    shared: &Shared<R, S>,
    missing: Vec<(String, crate::config::ConfigValue)>,
) -> Result<()>
where
    R: UserRecord,
    S: BackingStore,
{
    let system = shared.options.system_name.as_str();
    let mut session = shared.store.begin(TxnMode::Write).await?;
    for (name, value) in missing {
        let raw = serde_json::to_string(&value)?;
        session
            .kv_set(system, &format!("{CONFIG_KEY_PREFIX}{name}"), &raw)
            .await?;
    }
    session.commit().await
}

// =============================================================================
// Statistics
// =============================================================================

/// Persists a stat record if enabled and the stat interval has passed.
async fn persist_stats<R, S>(shared: &Shared<R, S>)
where
    R: UserRecord,
    S: BackingStore,
{
    let config = shared.config.current();
    if !config.stat_persist {
        return;
    }
    {
        let state = shared.reload.lock();
        if let Some(at) = state.last_stat {
            if at.elapsed() < config.stat_interval() {
                return;
            }
        }
    }

    let counts = shared
        .mirror
        .data()
        .counts()
        .into_iter()
        .map(|((type_name, namespace), count)| TypeCount {
            type_name,
            namespace,
            count,
        })
        .collect();
    let result: Result<()> = async {
        let resources = tokio::task::spawn_blocking(collect_resource_metrics)
            .await
            .map_err(join_error)?;
        let body = StatBody {
            counts,
            engine: shared.metrics_snapshot(),
            resources,
        };
        let record = StatRecord {
            created_at: now(),
            body: serde_json::to_string(&body)?,
        };
        let mut session = shared.store.begin(TxnMode::Write).await?;
        session
            .insert_stat(&shared.options.system_name, &record)
            .await?;
        session.commit().await
    }
    .await;

    match result {
        Ok(()) => shared.reload.lock().last_stat = Some(Instant::now()),
        Err(e) => warn!(error = %e, "could not persist stat record"),
    }
}

// =============================================================================
// Backup
// =============================================================================

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}

async fn save_backup<R, S>(shared: &Shared<R, S>, rows: Vec<StoredObject>)
where
    R: UserRecord,
    S: BackingStore,
{
    let Some(files) = shared.backup.clone() else {
        return;
    };
    let config = shared.config.current();
    let count = rows.len();
    let result = tokio::task::spawn_blocking(move || files.save(rows, &config))
        .await
        .map_err(join_error)
        .and_then(|r| r);
    match result {
        Ok(()) => debug!(objects = count, "local backup written"),
        Err(e) => warn!(error = %e, "could not write local backup"),
    }
}

/// Loads the local backup into the empty mirror and enters degraded mode.
async fn fall_back<R, S>(shared: &Shared<R, S>)
where
    R: UserRecord,
    S: BackingStore,
{
    if shared.options.disable_backup_fallback {
        return;
    }
    let Some(files) = shared.backup.clone() else {
        return;
    };

    match load_backup(shared, files).await {
        Ok(count) => {
            shared.degraded.store(true, Ordering::Release);
            shared.metrics.record_backup_load();
            warn!(
                system = %shared.options.system_name,
                objects = count,
                "serving from local backup in read-only mode"
            );
        }
        Err(e) => warn!(error = %e, "local backup fallback failed"),
    }
}

async fn load_backup<R, S>(shared: &Shared<R, S>, files: BackupFiles) -> Result<usize>
where
    R: UserRecord,
    S: BackingStore,
{
    let (objects, config) = tokio::task::spawn_blocking(move || {
        let objects = files.load_objects()?;
        Ok::<_, Error>((objects, files.load_config().ok()))
    })
    .await
    .map_err(join_error)??;

    let data = DataSet::new();
    for row in &objects.objects {
        let obj = HadbObject::<R>::from_stored(row)?;
        data.apply_if_newer(Arc::new(obj));
    }
    let count = data.len();
    if shared.mirror.is_loaded() {
        return Ok(count);
    }
    shared.mirror.install(Arc::new(data));

    if let Some(backup) = config {
        shared.config.apply(backup.config);
    }
    info!(saved_at = %objects.saved_at, objects = count, "loaded local backup");
    Ok(count)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_delay_stays_in_band() {
        let config = DynamicConfig {
            partial_reload_interval_ms: 1_000,
            ..DynamicConfig::default()
        };
        for _ in 0..100 {
            let d = next_delay(&config, true);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn failure_delay_uses_retry_interval() {
        let config = DynamicConfig {
            reload_retry_interval_ms: 2_000,
            ..DynamicConfig::default()
        };
        for _ in 0..100 {
            let d = next_delay(&config, false);
            assert!(d >= Duration::from_millis(1_000) && d <= Duration::from_millis(3_000));
        }
    }

    #[test]
    fn shift_is_a_floor_under_type_thresholds() {
        let config = DynamicConfig {
            partial_reload_shift_ms: 10_000,
            type_staleness: vec!["Host=5".to_string(), "Zone=60".to_string()],
            ..DynamicConfig::default()
        };
        let since = now();
        let filters = partial_filters(&config, since);

        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].type_name, None);
        assert_eq!(filters[0].updated_since, Some(since - chrono::Duration::seconds(10)));
        assert_eq!(filters[1].type_name.as_deref(), Some("Zone"));
        assert_eq!(filters[1].updated_since, Some(since - chrono::Duration::seconds(60)));
    }
}

//! # Lazy Update Queue ("Fast Update")
//!
//! A fast update mutates an object in the memory mirror immediately and
//! writes it to the backing store later, in the background. It exists for
//! high-frequency, low-value changes (last-seen timestamps, counters) that
//! must not pay for a transaction each.
//!
//! ## Per-Object State Machine
//!
//! ```text
//!            fast_update                 flush ok, version unchanged
//!   Clean ───────────────► Dirty ──────► Flushing ───────────────────► Clean
//!                            ▲              │
//!                            │              │ fast update raced in
//!                            └──────────────┘ (stays pending)
//! ```
//!
//! ## Rules
//!
//! - The mutator runs under the object's lock on a clone of the record
//! - "No change" (mutator returns false, or identical serialized payload)
//!   returns the current object untouched
//! - Keys and labels must not change; that is what write transactions are for
//! - `ver`, archiving and snapshot numbering are never touched
//! - The flush write is conditional on `(uid, ver, update_dt older)`; zero
//!   rows affected means a transaction superseded the object, which is
//!   dropped silently

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::mirror::{CellState, DataSet, ObjectCell};
use crate::store::{BackingStore, StoreSession};
use crate::types::{next_update_dt, HadbObject, TxnMode, Uid, UserRecord};

// =============================================================================
// Pending Set
// =============================================================================

/// Objects with unflushed fast updates.
///
/// Entries share the mirror's [`ObjectCell`]s; nothing is cloned.
pub(crate) struct PendingQueue<R> {
    pending: Mutex<HashMap<Uid, Arc<ObjectCell<R>>>>,
}

impl<R: UserRecord> PendingQueue<R> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Marks the object dirty. Already pending is a no-op unless the entry
    /// still points at a cell from a retired data set.
    fn enqueue(&self, uid: &Uid, cell: &Arc<ObjectCell<R>>) {
        let mut pending = self.pending.lock();
        match pending.get_mut(uid) {
            Some(slot) if Arc::ptr_eq(slot, cell) => {}
            Some(slot) => *slot = Arc::clone(cell),
            None => {
                pending.insert(uid.clone(), Arc::clone(cell));
            }
        }
    }

    fn snapshot(&self) -> Vec<(Uid, Arc<ObjectCell<R>>)> {
        self.pending
            .lock()
            .iter()
            .map(|(uid, cell)| (uid.clone(), Arc::clone(cell)))
            .collect()
    }

    /// Removes `uid` if it still points at `flushed` and no fast update
    /// happened since `flushed_version` was read.
    fn remove_if_unchanged(&self, uid: &Uid, flushed: &Arc<ObjectCell<R>>, flushed_version: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(uid) {
            Some(cell) if Arc::ptr_eq(cell, flushed) && cell.fast_update_version() == flushed_version => {
                pending.remove(uid);
                true
            }
            _ => false,
        }
    }

    /// Carries pending objects over into a freshly built data set.
    ///
    /// Pending versions newer than the loaded rows are re-applied, and the
    /// queue entries are pointed at the new cells. The new cell's fast
    /// version is raised by the old one's, so a flush still running against
    /// the old cell cannot dequeue updates made on the new one.
    pub(crate) fn relink(&self, data: &DataSet<R>) {
        let entries = self.snapshot();
        for (_, cell) in &entries {
            data.apply_if_newer(cell.load());
        }

        let mut pending = self.pending.lock();
        for (uid, old) in entries {
            let Some(fresh) = data.cell(&uid) else {
                continue;
            };
            if let Some(slot) = pending.get_mut(&uid) {
                if Arc::ptr_eq(slot, &old) && !Arc::ptr_eq(&fresh, &old) {
                    fresh
                        .fast_version
                        .fetch_add(old.fast_update_version(), Ordering::AcqRel);
                    *slot = fresh;
                }
            }
        }
    }
}

// =============================================================================
// Fast Path
// =============================================================================

/// Applies `mutate` to the object's record in memory and queues it for
/// flushing.
pub(crate) fn fast_update<R, S, F>(shared: &Shared<R, S>, uid: &Uid, mutate: F) -> Result<Arc<HadbObject<R>>>
where
    R: UserRecord,
    S: BackingStore,
    F: FnOnce(&mut R) -> bool,
{
    if !shared.mirror.is_loaded() {
        return Err(Error::NotReady);
    }
    if shared.is_degraded() {
        return Err(Error::ReadOnly(
            "engine is serving from its local backup".to_string(),
        ));
    }

    // A full reload may retire the data set between the lookup and the lock;
    // follow it to its successor.
    let mut data = shared.mirror.data();
    loop {
        let cell = data
            .cell(uid)
            .ok_or_else(|| Error::NotFound(format!("object '{uid}'")))?;
        let state = cell.lock();
        if let Some(next) = data.successor() {
            drop(state);
            data = next;
            continue;
        }
        return apply_locked(shared, uid, &cell, state, mutate);
    }
}

fn apply_locked<R, S, F>(
    shared: &Shared<R, S>,
    uid: &Uid,
    cell: &Arc<ObjectCell<R>>,
    mut state: MutexGuard<'_, CellState>,
    mutate: F,
) -> Result<Arc<HadbObject<R>>>
where
    R: UserRecord,
    S: BackingStore,
    F: FnOnce(&mut R) -> bool,
{
    let current = cell.load();
    if !current.is_live() {
        return Err(Error::NotFound(format!("object '{uid}' is deleted")));
    }

    let now = Instant::now();
    if let Some(quota) = shared.options.fast_update_quota {
        while let Some(oldest) = state.recent_fast_updates.front() {
            if now.duration_since(*oldest) >= quota.per {
                state.recent_fast_updates.pop_front();
            } else {
                break;
            }
        }
        if state.recent_fast_updates.len() >= quota.max_updates {
            shared.metrics.record_throttled();
            debug!(%uid, "fast update quota reached, returning current value");
            return Ok(current);
        }
    }

    let mut record = current.user_data.clone();
    if !mutate(&mut record) {
        return Ok(current);
    }
    if serde_json::to_string(&record)? == serde_json::to_string(&current.user_data)? {
        return Ok(current);
    }

    let mut next = HadbObject::clone(&current);
    next.user_data = record;
    next.refresh_derived(shared.options.full_text_search);
    if next.keys != current.keys || next.labels != current.labels || next.type_name != current.type_name {
        return Err(Error::IndexFieldMutated { uid: uid.to_string() });
    }
    next.update_dt = next_update_dt(current.update_dt);

    let next = Arc::new(next);
    cell.current.store(Arc::clone(&next));
    cell.fast_version.fetch_add(1, Ordering::AcqRel);
    if shared.options.fast_update_quota.is_some() {
        state.recent_fast_updates.push_back(now);
    }
    shared.queue.enqueue(uid, cell);
    drop(state);

    shared.metrics.record_fast_update();
    Ok(next)
}

// =============================================================================
// Flush
// =============================================================================

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Written and removed from the pending set.
    pub flushed: usize,
    /// Written, but updated again meanwhile; stays pending.
    pub requeued: usize,
    /// Zero rows affected: a transaction wrote a newer version.
    pub superseded: usize,
    /// Write failed; stays pending for the next pass.
    pub failed: usize,
}

impl FlushReport {
    fn add(&mut self, other: FlushReport) {
        self.flushed += other.flushed;
        self.requeued += other.requeued;
        self.superseded += other.superseded;
        self.failed += other.failed;
    }
}

/// Drains the pending set across the configured number of parallel lanes.
pub(crate) async fn flush_pending<R, S>(shared: &Shared<R, S>) -> FlushReport
where
    R: UserRecord,
    S: BackingStore,
{
    let batch = shared.queue.snapshot();
    if batch.is_empty() {
        return FlushReport::default();
    }

    let lanes = shared.options.flush_connections.max(1).min(batch.len());
    let mut groups: Vec<Vec<(Uid, Arc<ObjectCell<R>>)>> = vec![Vec::new(); lanes];
    for (i, entry) in batch.into_iter().enumerate() {
        groups[i % lanes].push(entry);
    }

    let mut report = FlushReport::default();
    for lane in join_all(groups.into_iter().map(|group| flush_lane(shared, group))).await {
        report.add(lane);
    }
    shared.metrics.record_flush(&report);
    report
}

async fn flush_lane<R, S>(shared: &Shared<R, S>, group: Vec<(Uid, Arc<ObjectCell<R>>)>) -> FlushReport
where
    R: UserRecord,
    S: BackingStore,
{
    let mut report = FlushReport::default();
    let system = shared.options.system_name.as_str();

    let mut session = match shared.store.begin(TxnMode::Write).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, pending = group.len(), "flush lane could not open a session");
            report.failed = group.len();
            return report;
        }
    };

    let mut written = Vec::with_capacity(group.len());
    let mut superseded = Vec::new();
    let total = group.len();
    for (uid, cell) in group {
        let version = cell.fast_update_version();
        let row = match cell.load().to_stored() {
            Ok(row) => row,
            Err(e) => {
                warn!(%uid, error = %e, "cannot serialize pending object, dropping it");
                shared.queue.remove_if_unchanged(&uid, &cell, version);
                report.failed += 1;
                continue;
            }
        };
        match session.update_object_if_older(system, &row).await {
            Ok(0) => superseded.push((uid, cell, version)),
            Ok(_) => written.push((uid, cell, version)),
            Err(e) => {
                warn!(%uid, error = %e, "flush write failed, aborting lane");
                report.failed = total;
                return report;
            }
        }
    }

    if let Err(e) = session.commit().await {
        warn!(error = %e, "flush commit failed");
        report.failed += written.len() + superseded.len();
        return report;
    }

    for (uid, cell, version) in written {
        if shared.queue.remove_if_unchanged(&uid, &cell, version) {
            report.flushed += 1;
        } else {
            report.requeued += 1;
        }
    }
    for (uid, cell, version) in superseded {
        shared.queue.remove_if_unchanged(&uid, &cell, version);
        report.superseded += 1;
        debug!(%uid, "pending fast update superseded by a transaction");
    }
    report
}

/// Background flush loop. Runs until `cancel` fires.
pub(crate) async fn run_flush_loop<R, S>(shared: Arc<Shared<R, S>>, cancel: CancellationToken)
where
    R: UserRecord,
    S: BackingStore,
{
    info!(system = %shared.options.system_name, "fast update flush loop started");
    loop {
        let interval = shared.config.current().fast_update_flush_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.is_degraded() {
            continue;
        }
        let report = flush_pending(&shared).await;
        if report != FlushReport::default() {
            debug!(
                flushed = report.flushed,
                requeued = report.requeued,
                superseded = report.superseded,
                failed = report.failed,
                "flush pass finished"
            );
        }
    }
    info!(system = %shared.options.system_name, "fast update flush loop stopped");
}

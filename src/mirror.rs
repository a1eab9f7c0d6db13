//! # Indexed Memory Mirror
//!
//! The mirror is a complete in-memory copy of every non-archived object plus
//! two secondary indices. Lookups never touch the backing store and never
//! block on writers.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ Mirror<R>                                                           │
//! │   data: ArcSwap<DataSet<R>>   (swapped wholesale on full reload)    │
//! │                                                                     │
//! │   DataSet<R>                                                        │
//! │   ┌──────────────────────┐  ┌───────────────────────────────────┐   │
//! │   │ all: DashMap         │  │ keys:   CowIndex<Uid>             │   │
//! │   │  Uid → ObjectCell    │  │ labels: CowIndex<Arc<HashSet<Uid>>│   │
//! │   │   ├ lock (per obj)   │  │  64 shards, each an               │   │
//! │   │   └ current: ArcSwap │  │  ArcSwap<HashMap> updated by RCU  │   │
//! │   └──────────────────────┘  └───────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Mutation
//!
//! [`DataSet::apply_if_newer`] is the single structural mutation entry point.
//! It takes the target object's lock, compares versions, publishes the new
//! object and swaps the index entries shard by shard via compare-and-swap.
//! Two writers touching different objects never contend on a lock; they may
//! retry a shard CAS.
//!
//! ## Hand-over On Full Reload
//!
//! A full reload builds a new data set and then calls
//! [`DataSet::hand_over`] on the old one before installing the new one:
//!
//! ```text
//!   old.successor = new          (writers now follow the link)
//!   for cell in old: lock, copy current into new
//!   mirror.install(new)
//! ```
//!
//! Writers check the successor link while holding the cell lock, so every
//! write to the old set either happens before that cell is copied or is
//! redirected to the new set. Whatever a reader saw in the old set is
//! therefore already in the new one when it becomes visible.
//!
//! ## Reading Under Concurrent Writes
//!
//! Index hits are always re-checked against the object's current version.
//! A lookup racing with a re-index may miss an object for an instant but never
//! returns an object whose current keys or labels do not match the query.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result};
use crate::types::{HadbObject, IndexFields, Uid, UserRecord, MAX_INDEX_FIELDS};

/// Number of copy-on-write shards per secondary index.
const INDEX_SHARDS: usize = 64;

// =============================================================================
// Index Keys
// =============================================================================

/// Identifies one index entry: a normalized value in one column of one
/// type/namespace partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct IndexKey {
    value: String,
    column: u8,
    type_name: String,
    namespace: String,
}

impl IndexKey {
    fn new(value: &str, column: usize, type_name: &str, namespace: &str) -> Self {
        Self {
            value: value.to_string(),
            column: column as u8,
            type_name: type_name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn shard(&self) -> usize {
        let mut hasher = Xxh3::new();
        hasher.update(self.value.as_bytes());
        hasher.update(&[0, self.column]);
        hasher.update(self.type_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.namespace.as_bytes());
        (hasher.digest() as usize) % INDEX_SHARDS
    }
}

/// Index keys an object occupies, empty if it is not live.
fn index_keys<R: UserRecord>(obj: &HadbObject<R>, fields: &IndexFields) -> [Option<IndexKey>; MAX_INDEX_FIELDS] {
    let mut out: [Option<IndexKey>; MAX_INDEX_FIELDS] = Default::default();
    if obj.is_live() {
        for (slot, value) in fields.filled() {
            out[slot] = Some(IndexKey::new(value, slot, &obj.type_name, &obj.namespace));
        }
    }
    out
}

// =============================================================================
// Copy-on-Write Index
// =============================================================================

/// A sharded persistent map: readers load a shard snapshot without locking,
/// writers clone the shard, modify it and publish it by compare-and-swap.
pub(crate) struct CowIndex<V> {
    shards: Vec<ArcSwap<HashMap<IndexKey, V>>>,
}

impl<V: Clone> CowIndex<V> {
    fn new() -> Self {
        Self {
            shards: (0..INDEX_SHARDS)
                .map(|_| ArcSwap::from_pointee(HashMap::new()))
                .collect(),
        }
    }

    fn get(&self, key: &IndexKey) -> Option<V> {
        self.shards[key.shard()].load().get(key).cloned()
    }

    /// Replaces the entry for `key` with `f(current)`; `None` removes it.
    fn update(&self, key: &IndexKey, f: impl Fn(Option<&V>) -> Option<V>) {
        self.shards[key.shard()].rcu(|shard| {
            let mut next = HashMap::clone(shard);
            match f(shard.get(key)) {
                Some(v) => {
                    next.insert(key.clone(), v);
                }
                None => {
                    next.remove(key);
                }
            }
            next
        });
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.load().len()).sum()
    }
}

// =============================================================================
// Object Cells
// =============================================================================

/// Per-object state owned by the mirror.
///
/// `current` is read lock-free. `lock` serializes writers of this object only
/// and is never held across I/O. The same cell is shared by the mirror and the
/// lazy update queue.
pub struct ObjectCell<R> {
    pub(crate) current: ArcSwap<HadbObject<R>>,
    pub(crate) lock: Mutex<CellState>,
    pub(crate) fast_version: AtomicU64,
}

/// Writer-side state guarded by the cell lock.
#[derive(Default)]
pub(crate) struct CellState {
    /// Timestamps of recent accepted fast updates (quota window).
    pub(crate) recent_fast_updates: VecDeque<Instant>,
}

impl<R> ObjectCell<R> {
    fn new(obj: Arc<HadbObject<R>>) -> Self {
        Self {
            current: ArcSwap::new(obj),
            lock: Mutex::new(CellState::default()),
            fast_version: AtomicU64::new(0),
        }
    }

    /// Current version of the object.
    pub fn load(&self) -> Arc<HadbObject<R>> {
        self.current.load_full()
    }

    /// Number of fast updates applied to this cell so far.
    pub fn fast_update_version(&self) -> u64 {
        self.fast_version.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CellState> {
        self.lock.lock()
    }
}

/// What [`DataSet::apply_if_newer`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    /// Incoming was not newer (or was an archived copy).
    Ignored,
}

/// Version ordering used by the mirror: higher `ver` wins, and for the same
/// `ver` the later `update_dt` wins (same-generation echoes and fast updates).
pub fn is_newer<R>(incoming: &HadbObject<R>, current: &HadbObject<R>) -> bool {
    incoming.ver > current.ver
        || (incoming.ver == current.ver && incoming.update_dt > current.update_dt)
}

// =============================================================================
// Search Options
// =============================================================================

/// Field a full-text result list is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    UpdateDt,
    CreateDt,
    Ver,
    Uid,
}

/// Ordering and truncation for [`DataSet::full_text_search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// `(field, descending)` pairs applied in order.
    pub sort: Vec<(SortField, bool)>,
    /// Zero means no cap.
    pub max_results: usize,
}

fn compare_by<R>(a: &HadbObject<R>, b: &HadbObject<R>, sort: &[(SortField, bool)]) -> CmpOrdering {
    for (field, desc) in sort {
        let ord = match field {
            SortField::UpdateDt => a.update_dt.cmp(&b.update_dt),
            SortField::CreateDt => a.create_dt.cmp(&b.create_dt),
            SortField::Ver => a.ver.cmp(&b.ver),
            SortField::Uid => a.uid.cmp(&b.uid),
        };
        let ord = if *desc { ord.reverse() } else { ord };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    a.uid.cmp(&b.uid)
}

// =============================================================================
// DataSet
// =============================================================================

/// All live objects plus key and label indices.
pub struct DataSet<R> {
    all: DashMap<Uid, Arc<ObjectCell<R>>>,
    keys: CowIndex<Uid>,
    labels: CowIndex<Arc<HashSet<Uid>>>,
    /// Set once a full reload has replaced this data set.
    successor: OnceLock<Arc<DataSet<R>>>,
}

impl<R: UserRecord> DataSet<R> {
    pub fn new() -> Self {
        Self {
            all: DashMap::new(),
            keys: CowIndex::new(),
            labels: CowIndex::new(),
            successor: OnceLock::new(),
        }
    }

    /// The data set that replaced this one, if any.
    pub fn successor(&self) -> Option<Arc<DataSet<R>>> {
        self.successor.get().cloned()
    }

    /// Retires this data set in favour of `next`.
    ///
    /// From here on writers are redirected to `next`. With `carry_objects`,
    /// every object held here is merged into `next` under its cell lock, so
    /// nothing written before the redirect is lost. Returns `false` if this
    /// data set was already retired.
    pub fn hand_over(&self, next: &Arc<DataSet<R>>, carry_objects: bool) -> bool {
        if self.successor.set(Arc::clone(next)).is_err() {
            return false;
        }
        if !carry_objects {
            return true;
        }
        // Collect first: inserters take the cell lock before the map shard.
        let cells: Vec<_> = self.all.iter().map(|c| Arc::clone(c.value())).collect();
        for cell in cells {
            let _guard = cell.lock();
            next.apply_if_newer(cell.load());
        }
        true
    }

    /// Number of objects (live and deleted) held.
    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Number of key index entries (for diagnostics and tests).
    pub fn key_entries(&self) -> usize {
        self.keys.len()
    }

    /// Merges `incoming` if it is newer than what the mirror holds.
    ///
    /// A retired data set forwards the write to its successor.
    pub fn apply_if_newer(&self, incoming: Arc<HadbObject<R>>) -> ApplyOutcome {
        if incoming.archive {
            return ApplyOutcome::Ignored;
        }
        let mut target = self;
        loop {
            if let Some(outcome) = target.apply_here(&incoming) {
                return outcome;
            }
            match target.successor.get() {
                Some(next) => target = &**next,
                None => return ApplyOutcome::Ignored,
            }
        }
    }

    /// `None` when this data set is retired.
    fn apply_here(&self, incoming: &Arc<HadbObject<R>>) -> Option<ApplyOutcome> {
        let existing = self.all.get(&incoming.uid).map(|c| Arc::clone(c.value()));
        let cell = match existing {
            Some(cell) => cell,
            None => {
                let cell = Arc::new(ObjectCell::new(Arc::clone(incoming)));
                // Lock before publishing so a concurrent replacer waits for
                // the initial index entries.
                let guard = cell.lock();
                match self.all.entry(incoming.uid.clone()) {
                    Entry::Vacant(slot) => {
                        // Checked under the shard lock: a hand-over either
                        // collects this cell or is seen here.
                        if self.successor.get().is_some() {
                            return None;
                        }
                        slot.insert(Arc::clone(&cell));
                        self.reindex(None, incoming);
                        drop(guard);
                        return Some(ApplyOutcome::Inserted);
                    }
                    Entry::Occupied(slot) => {
                        let winner = Arc::clone(slot.get());
                        drop(slot);
                        drop(guard);
                        winner
                    }
                }
            }
        };

        let _guard = cell.lock();
        if self.successor.get().is_some() {
            return None;
        }
        let current = cell.load();
        if !is_newer(&**incoming, &*current) {
            return Some(ApplyOutcome::Ignored);
        }
        cell.current.store(Arc::clone(incoming));
        self.reindex(Some(&current), incoming);
        Some(ApplyOutcome::Replaced)
    }

    /// Moves index entries from `old` to `new`. Caller holds the cell lock.
    fn reindex(&self, old: Option<&HadbObject<R>>, new: &HadbObject<R>) {
        let uid = &new.uid;

        let old_keys = old.map(|o| index_keys(o, &o.keys)).unwrap_or_default();
        let new_keys = index_keys(new, &new.keys);
        for slot in 0..MAX_INDEX_FIELDS {
            if old_keys[slot] == new_keys[slot] {
                continue;
            }
            if let Some(key) = &old_keys[slot] {
                self.keys.update(key, |cur| match cur {
                    Some(holder) if holder == uid => None,
                    other => other.cloned(),
                });
            }
            if let Some(key) = &new_keys[slot] {
                self.keys.update(key, |cur| {
                    if let Some(holder) = cur {
                        if holder != uid {
                            tracing::warn!(
                                key = %key.value,
                                holder = %holder,
                                incoming = %uid,
                                "key index collision; newest write wins"
                            );
                        }
                    }
                    Some(uid.clone())
                });
            }
        }

        let old_labels = old.map(|o| index_keys(o, &o.labels)).unwrap_or_default();
        let new_labels = index_keys(new, &new.labels);
        for slot in 0..MAX_INDEX_FIELDS {
            if old_labels[slot] == new_labels[slot] {
                continue;
            }
            if let Some(key) = &old_labels[slot] {
                self.labels.update(key, |cur| {
                    let set = cur?;
                    let mut next = HashSet::clone(set);
                    next.remove(uid);
                    if next.is_empty() {
                        None
                    } else {
                        Some(Arc::new(next))
                    }
                });
            }
            if let Some(key) = &new_labels[slot] {
                self.labels.update(key, |cur| {
                    let mut next = cur.map(|s| HashSet::clone(s)).unwrap_or_default();
                    next.insert(uid.clone());
                    Some(Arc::new(next))
                });
            }
        }
    }

    /// Returns the cell for `uid`.
    pub fn cell(&self, uid: &Uid) -> Option<Arc<ObjectCell<R>>> {
        self.all.get(uid).map(|c| Arc::clone(c.value()))
    }

    /// Point lookup by Uid. Deleted objects are returned too.
    pub fn get(&self, uid: &Uid) -> Option<Arc<HadbObject<R>>> {
        self.all.get(uid).map(|c| c.value().load())
    }

    /// Point lookup constrained to a type and namespace.
    pub fn get_typed(&self, uid: &Uid, type_name: &str, namespace: &str) -> Option<Arc<HadbObject<R>>> {
        self.get(uid)
            .filter(|o| o.type_name == type_name && o.namespace == namespace)
    }

    /// Finds the single live object holding any of the filled keys.
    ///
    /// # Errors
    ///
    /// `Error::Consistency` if different key slots resolve to different
    /// objects.
    pub fn search_by_key(
        &self,
        keys: &IndexFields,
        type_name: &str,
        namespace: &str,
    ) -> Result<Option<Arc<HadbObject<R>>>> {
        let mut found: Option<Arc<HadbObject<R>>> = None;
        for (slot, value) in keys.filled() {
            let key = IndexKey::new(value, slot, type_name, namespace);
            let Some(uid) = self.keys.get(&key) else {
                continue;
            };
            let Some(obj) = self.get(&uid) else {
                continue;
            };
            if !obj.is_live() || obj.keys.get(slot) != Some(value) {
                continue;
            }
            match &found {
                Some(prev) if prev.uid != obj.uid => {
                    return Err(Error::Consistency(format!(
                        "keys of {type_name}/{namespace} resolve to both '{}' and '{}'",
                        prev.uid, obj.uid
                    )));
                }
                Some(_) => {}
                None => found = Some(obj),
            }
        }
        Ok(found)
    }

    /// Returns the live objects carrying every filled label.
    ///
    /// An entirely empty label set returns nothing, not everything.
    pub fn search_by_labels(
        &self,
        labels: &IndexFields,
        type_name: &str,
        namespace: &str,
    ) -> Vec<Arc<HadbObject<R>>> {
        let mut sets = Vec::new();
        for (slot, value) in labels.filled() {
            let key = IndexKey::new(value, slot, type_name, namespace);
            match self.labels.get(&key) {
                Some(set) => sets.push(set),
                None => return Vec::new(),
            }
        }
        sets.sort_by_key(|s| s.len());
        let Some((smallest, rest)) = sets.split_first() else {
            return Vec::new();
        };
        let mut out: Vec<_> = smallest
            .iter()
            .filter(|uid| rest.iter().all(|s| s.contains(*uid)))
            .filter_map(|uid| self.get(uid))
            .filter(|obj| {
                obj.is_live()
                    && obj.type_name == type_name
                    && obj.namespace == namespace
                    && labels.filled().all(|(slot, v)| obj.labels.get(slot) == Some(v))
            })
            .collect();
        out.sort_by(|a, b| a.uid.cmp(&b.uid));
        out
    }

    /// Linear scan over live objects of one type and namespace, matching every
    /// whitespace-separated query term against the search blobs.
    pub fn full_text_search(
        &self,
        type_name: &str,
        namespace: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Vec<Arc<HadbObject<R>>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<Arc<HadbObject<R>>> = self
            .all
            .iter()
            .map(|c| c.value().load())
            .filter(|o| o.is_live() && o.type_name == type_name && o.namespace == namespace)
            .filter(|o| {
                let a = o.search1.as_deref().unwrap_or("");
                let b = o.search2.as_deref().unwrap_or("");
                terms.iter().all(|t| a.contains(t.as_str()) || b.contains(t.as_str()))
            })
            .collect();

        hits.sort_by(|a, b| compare_by(a, b, &options.sort));
        if options.max_results > 0 {
            hits.truncate(options.max_results);
        }
        hits
    }

    /// Live object counts per `(type, namespace)`.
    pub fn counts(&self) -> BTreeMap<(String, String), usize> {
        let mut counts = BTreeMap::new();
        for cell in self.all.iter() {
            let obj = cell.value().load();
            if obj.is_live() {
                *counts
                    .entry((obj.type_name.clone(), obj.namespace.clone()))
                    .or_insert(0) += 1;
            }
        }
        counts
    }

    /// Current version of every held object.
    pub fn objects(&self) -> Vec<Arc<HadbObject<R>>> {
        self.all.iter().map(|c| c.value().load()).collect()
    }
}

impl<R: UserRecord> Default for DataSet<R> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Mirror
// =============================================================================

/// The engine's mirror: the current [`DataSet`] plus a populated flag.
pub struct Mirror<R> {
    data: ArcSwap<DataSet<R>>,
    loaded: AtomicBool,
}

impl<R: UserRecord> Mirror<R> {
    pub fn new() -> Self {
        Self {
            data: ArcSwap::from_pointee(DataSet::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Has a full reload or backup load ever populated the mirror?
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// The current data set. Cheap; hold it only for the duration of a lookup.
    pub fn data(&self) -> Arc<DataSet<R>> {
        self.data.load_full()
    }

    /// Installs a freshly built data set and returns the previous one.
    pub fn install(&self, next: Arc<DataSet<R>>) -> Arc<DataSet<R>> {
        let previous = self.data.swap(next);
        self.loaded.store(true, Ordering::Release);
        previous
    }

    /// Merges into the current data set.
    pub fn apply_if_newer(&self, incoming: Arc<HadbObject<R>>) -> ApplyOutcome {
        self.data.load().apply_if_newer(incoming)
    }
}

impl<R: UserRecord> Default for Mirror<R> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

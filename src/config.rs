//! # Configuration
//!
//! Two layers of configuration drive the engine:
//!
//! - [`EngineOptions`]: static, chosen by the embedding service at construction
//!   (system name, backup directory, flush connection count, ...)
//! - [`DynamicConfig`]: tunable intervals and limits persisted in the backing
//!   store's key-value table and re-read on every reload cycle
//!
//! ## Dynamic Config Binding
//!
//! Instead of reflecting over struct fields, every dynamic knob is listed once
//! in [`FIELDS`] as a `(name, getter, setter, range)` descriptor. Merging a
//! persisted key-value set walks the table:
//!
//! ```text
//! persisted kv ──► for each descriptor ──► parse ─► clamp ─► set
//!                         │
//!                         └─ missing/invalid ─► default (written back if missing)
//! ```
//!
//! Listeners subscribe through [`ConfigHub::subscribe`] and are notified only
//! when the effective configuration changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Key-value prefix under which dynamic config values are persisted.
pub const CONFIG_KEY_PREFIX: &str = "config.";

// =============================================================================
// Dynamic Config
// =============================================================================

/// Typed dynamic configuration.
///
/// Interval fields are plain integers so they persist as readable JSON; use
/// the accessor methods for `Duration`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// Full reload cadence.
    pub full_reload_interval_secs: i64,
    /// Partial reload cadence (also the steady-state loop tick).
    pub partial_reload_interval_ms: i64,
    /// Partial reloads fetch rows updated at or after
    /// `last_reload - partial_reload_shift_ms`.
    pub partial_reload_shift_ms: i64,
    /// Loop interval after a failed cycle.
    pub reload_retry_interval_ms: i64,
    /// A write transaction cuts a new snapshot once this much time has passed
    /// since the last one. Zero disables automatic snapshots.
    pub auto_snapshot_interval_secs: i64,
    /// How often a deadlocked transaction body is retried.
    pub deadlock_retry_count: i64,
    /// Average backoff step between deadlock retries.
    pub deadlock_retry_avg_interval_ms: i64,
    /// Backoff cap between deadlock retries.
    pub deadlock_retry_max_interval_ms: i64,
    /// Global concurrent read transactions (0 = unlimited).
    pub max_read_txns: i64,
    /// Global concurrent write transactions (0 = unlimited).
    pub max_write_txns: i64,
    /// Concurrent read transactions per client key (0 = unlimited).
    pub max_read_txns_per_client: i64,
    /// Concurrent write transactions per client key (0 = unlimited).
    pub max_write_txns_per_client: i64,
    /// Lazy update queue flush cadence.
    pub fast_update_flush_interval_ms: i64,
    /// Minimum time between persisted stat records.
    pub stat_interval_secs: i64,
    /// Whether full reloads persist stat records at all.
    pub stat_persist: bool,
    /// Per-type staleness thresholds, `"TypeName=seconds"`.
    pub type_staleness: Vec<String>,
    /// Free-form operator message surfaced through engine metrics.
    pub maintenance_message: String,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            full_reload_interval_secs: 3600,
            partial_reload_interval_ms: 5_000,
            partial_reload_shift_ms: 2_000,
            reload_retry_interval_ms: 3_000,
            auto_snapshot_interval_secs: 3600,
            deadlock_retry_count: 5,
            deadlock_retry_avg_interval_ms: 50,
            deadlock_retry_max_interval_ms: 1_000,
            max_read_txns: 0,
            max_write_txns: 0,
            max_read_txns_per_client: 0,
            max_write_txns_per_client: 0,
            fast_update_flush_interval_ms: 1_000,
            stat_interval_secs: 300,
            stat_persist: true,
            type_staleness: Vec::new(),
            maintenance_message: String::new(),
        }
    }
}

fn millis(v: i64) -> Duration {
    Duration::from_millis(v.max(0) as u64)
}

/// Loop intervals never drop below [`MIN_LOOP_INTERVAL_MS`], even for a
/// config built in code rather than merged from the store.
fn loop_millis(v: i64) -> Duration {
    millis(v.max(MIN_LOOP_INTERVAL_MS))
}

fn limit(v: i64) -> Option<usize> {
    if v <= 0 {
        None
    } else {
        Some(v as usize)
    }
}

impl DynamicConfig {
    pub fn full_reload_interval(&self) -> Duration {
        Duration::from_secs(self.full_reload_interval_secs.max(0) as u64)
    }

    pub fn partial_reload_interval(&self) -> Duration {
        loop_millis(self.partial_reload_interval_ms)
    }

    pub fn partial_reload_shift(&self) -> Duration {
        millis(self.partial_reload_shift_ms)
    }

    pub fn reload_retry_interval(&self) -> Duration {
        loop_millis(self.reload_retry_interval_ms)
    }

    pub fn auto_snapshot_interval(&self) -> Option<Duration> {
        if self.auto_snapshot_interval_secs <= 0 {
            None
        } else {
            Some(Duration::from_secs(self.auto_snapshot_interval_secs as u64))
        }
    }

    pub fn deadlock_avg_interval(&self) -> Duration {
        millis(self.deadlock_retry_avg_interval_ms)
    }

    pub fn deadlock_max_interval(&self) -> Duration {
        millis(self.deadlock_retry_max_interval_ms)
    }

    pub fn fast_update_flush_interval(&self) -> Duration {
        loop_millis(self.fast_update_flush_interval_ms)
    }

    pub fn stat_interval(&self) -> Duration {
        Duration::from_secs(self.stat_interval_secs.max(0) as u64)
    }

    /// Global ceiling for the mode, `None` when unlimited.
    pub fn global_limit(&self, write: bool) -> Option<usize> {
        limit(if write { self.max_write_txns } else { self.max_read_txns })
    }

    /// Per-client ceiling for the mode, `None` when unlimited.
    pub fn client_limit(&self, write: bool) -> Option<usize> {
        limit(if write {
            self.max_write_txns_per_client
        } else {
            self.max_read_txns_per_client
        })
    }

    /// Parses `type_staleness` entries. Malformed entries are skipped.
    pub fn staleness_thresholds(&self) -> Vec<(String, Duration)> {
        self.type_staleness
            .iter()
            .filter_map(|entry| {
                let (name, secs) = entry.split_once('=')?;
                let secs: u64 = secs.trim().parse().ok()?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), Duration::from_secs(secs)))
            })
            .collect()
    }

    /// Merges a persisted key-value set onto the defaults.
    ///
    /// Keys are the bare field names (without [`CONFIG_KEY_PREFIX`]); values
    /// are JSON. Missing keys are reported so the caller can backfill them;
    /// invalid values fall back to the default and are reported too.
    pub fn merge(base: &DynamicConfig, persisted: &BTreeMap<String, String>) -> MergeOutcome {
        let mut config = base.clone();
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        for field in FIELDS {
            let Some(raw) = persisted.get(field.name) else {
                missing.push((field.name.to_string(), (field.get)(&config)));
                continue;
            };
            let parsed = serde_json::from_str::<ConfigValue>(raw)
                .map_err(Error::from)
                .and_then(|value| field.assign(&mut config, value));
            if let Err(e) = parsed {
                invalid.push(format!("{}: {}", field.name, e));
            }
        }

        MergeOutcome {
            config,
            missing,
            invalid,
        }
    }
}

/// Result of [`DynamicConfig::merge`].
#[derive(Debug)]
pub struct MergeOutcome {
    pub config: DynamicConfig,
    /// Fields absent from the persisted set, with the value to write back.
    pub missing: Vec<(String, ConfigValue)>,
    /// Human-readable descriptions of rejected values.
    pub invalid: Vec<String>,
}

// =============================================================================
// Descriptor Table
// =============================================================================

/// A dynamic config value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
    StrArray(Vec<String>),
}

/// Value kind of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Int,
    Bool,
    Str,
    StrArray,
}

/// One dynamic config knob.
pub struct ConfigField {
    pub name: &'static str,
    pub get: fn(&DynamicConfig) -> ConfigValue,
    pub set: fn(&mut DynamicConfig, ConfigValue) -> Result<()>,
    /// Inclusive bounds for integer values.
    pub range: Option<(i64, i64)>,
}

impl ConfigField {
    /// Clamps `value` to this field's bounds and stores it in `config`.
    pub fn assign(&self, config: &mut DynamicConfig, value: ConfigValue) -> Result<()> {
        (self.set)(config, self.clamp(value))
    }

    fn clamp(&self, value: ConfigValue) -> ConfigValue {
        match (value, self.range) {
            (ConfigValue::Int(v), Some((min, max))) => ConfigValue::Int(v.clamp(min, max)),
            (ConfigValue::Int(v), None) => ConfigValue::Int(v.max(0)),
            (other, _) => other,
        }
    }
}

fn type_error(name: &str, expected: ConfigKind, got: &ConfigValue) -> Error {
    Error::Config(format!("{name}: expected {expected:?}, got {got:?}"))
}

macro_rules! int_field {
    ($name:ident, $min:expr, $max:expr) => {
        ConfigField {
            name: stringify!($name),
            get: |c| ConfigValue::Int(c.$name),
            set: |c, v| match v {
                ConfigValue::Int(i) => {
                    c.$name = i;
                    Ok(())
                }
                other => Err(type_error(stringify!($name), ConfigKind::Int, &other)),
            },
            range: Some(($min, $max)),
        }
    };
}

const DAY_SECS: i64 = 86_400;
const HOUR_MS: i64 = 3_600_000;

/// Floor for loop intervals; zero would turn the background loops into
/// busy loops.
pub const MIN_LOOP_INTERVAL_MS: i64 = 10;

/// Every dynamic knob, in persistence order.
pub static FIELDS: &[ConfigField] = &[
    int_field!(full_reload_interval_secs, 1, 7 * DAY_SECS),
    int_field!(partial_reload_interval_ms, MIN_LOOP_INTERVAL_MS, HOUR_MS),
    int_field!(partial_reload_shift_ms, 0, HOUR_MS),
    int_field!(reload_retry_interval_ms, MIN_LOOP_INTERVAL_MS, HOUR_MS),
    int_field!(auto_snapshot_interval_secs, 0, 30 * DAY_SECS),
    int_field!(deadlock_retry_count, 0, 100),
    int_field!(deadlock_retry_avg_interval_ms, 0, 60_000),
    int_field!(deadlock_retry_max_interval_ms, 0, 600_000),
    int_field!(max_read_txns, 0, 1_000_000),
    int_field!(max_write_txns, 0, 1_000_000),
    int_field!(max_read_txns_per_client, 0, 1_000_000),
    int_field!(max_write_txns_per_client, 0, 1_000_000),
    int_field!(fast_update_flush_interval_ms, MIN_LOOP_INTERVAL_MS, HOUR_MS),
    int_field!(stat_interval_secs, 0, 7 * DAY_SECS),
    ConfigField {
        name: "stat_persist",
        get: |c| ConfigValue::Bool(c.stat_persist),
        set: |c, v| match v {
            ConfigValue::Bool(b) => {
                c.stat_persist = b;
                Ok(())
            }
            other => Err(type_error("stat_persist", ConfigKind::Bool, &other)),
        },
        range: None,
    },
    ConfigField {
        name: "type_staleness",
        get: |c| ConfigValue::StrArray(c.type_staleness.clone()),
        set: |c, v| match v {
            ConfigValue::StrArray(items) => {
                c.type_staleness = items;
                Ok(())
            }
            other => Err(type_error("type_staleness", ConfigKind::StrArray, &other)),
        },
        range: None,
    },
    ConfigField {
        name: "maintenance_message",
        get: |c| ConfigValue::Str(c.maintenance_message.clone()),
        set: |c, v| match v {
            ConfigValue::Str(s) => {
                c.maintenance_message = s;
                Ok(())
            }
            other => Err(type_error("maintenance_message", ConfigKind::Str, &other)),
        },
        range: None,
    },
];

/// Looks up a descriptor by name.
pub fn field(name: &str) -> Option<&'static ConfigField> {
    FIELDS.iter().find(|f| f.name == name)
}

// =============================================================================
// Config Hub
// =============================================================================

/// Holds the effective dynamic config and notifies listeners on change.
///
/// Reads are lock-free (`ArcSwap`); listeners get a `watch` receiver.
pub struct ConfigHub {
    current: ArcSwap<DynamicConfig>,
    notify: watch::Sender<Arc<DynamicConfig>>,
}

impl ConfigHub {
    pub fn new(initial: DynamicConfig) -> Self {
        let initial = Arc::new(initial);
        let (notify, _) = watch::channel(Arc::clone(&initial));
        Self {
            current: ArcSwap::new(initial),
            notify,
        }
    }

    /// The effective config.
    pub fn current(&self) -> Arc<DynamicConfig> {
        self.current.load_full()
    }

    /// Installs `next`. Returns true (and notifies) only if it differs from
    /// the current config.
    pub fn apply(&self, next: DynamicConfig) -> bool {
        if *self.current.load_full() == next {
            return false;
        }
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        self.notify.send_replace(next);
        true
    }

    /// Subscribes to effective-config changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DynamicConfig>> {
        self.notify.subscribe()
    }
}

// =============================================================================
// Engine Options
// =============================================================================

/// Per-object fast update quota: at most `max_updates` within `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastUpdateQuota {
    pub max_updates: usize,
    pub per: Duration,
}

/// Static engine options.
///
/// # Example
///
/// ```rust
/// use hadb::EngineOptions;
///
/// let options = EngineOptions {
///     flush_connections: 4,
///     ..EngineOptions::new("billing")
/// };
/// assert_eq!(options.system_name, "billing");
/// ```
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Scopes every backing-store row this engine reads and writes.
    pub system_name: String,
    /// Where the local backup files live. `None` disables backups.
    pub backup_dir: Option<PathBuf>,
    /// Never fall back to the local backup, even when the mirror is empty.
    pub disable_backup_fallback: bool,
    /// Long-lived connections used by the lazy update flush loop.
    pub flush_connections: usize,
    /// Optional per-object fast update quota.
    pub fast_update_quota: Option<FastUpdateQuota>,
    /// Maintain full-text search blobs.
    pub full_text_search: bool,
    /// Defaults merged under whatever the backing store holds.
    pub initial_config: DynamicConfig,
}

impl EngineOptions {
    pub fn new(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
            ..Self::default()
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            system_name: "default".to_string(),
            backup_dir: None,
            disable_backup_fallback: false,
            flush_connections: 2,
            fast_update_quota: None,
            full_text_search: false,
            initial_config: DynamicConfig::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn descriptor_names_match_serde_fields() {
        let json = serde_json::to_value(DynamicConfig::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), FIELDS.len());
        for f in FIELDS {
            assert!(obj.contains_key(f.name), "missing field {}", f.name);
        }
    }

    #[test]
    fn merge_backfills_missing_keys() {
        let outcome = DynamicConfig::merge(
            &DynamicConfig::default(),
            &persisted(&[("deadlock_retry_count", "9")]),
        );
        assert_eq!(outcome.config.deadlock_retry_count, 9);
        assert_eq!(outcome.missing.len(), FIELDS.len() - 1);
        assert!(outcome.invalid.is_empty());
        assert!(outcome
            .missing
            .iter()
            .any(|(name, v)| name == "stat_persist" && *v == ConfigValue::Bool(true)));
    }

    #[test]
    fn merge_clamps_and_rejects() {
        let outcome = DynamicConfig::merge(
            &DynamicConfig::default(),
            &persisted(&[
                ("deadlock_retry_count", "100000"),
                ("stat_persist", "\"yes\""),
                ("type_staleness", "[\"Host=60\"]"),
            ]),
        );
        assert_eq!(outcome.config.deadlock_retry_count, 100);
        assert!(outcome.config.stat_persist);
        assert_eq!(outcome.invalid.len(), 1);
        assert_eq!(
            outcome.config.staleness_thresholds(),
            vec![("Host".to_string(), Duration::from_secs(60))]
        );
    }

    #[test]
    fn merge_floors_loop_intervals() {
        let outcome = DynamicConfig::merge(
            &DynamicConfig::default(),
            &persisted(&[
                ("partial_reload_interval_ms", "0"),
                ("fast_update_flush_interval_ms", "0"),
                ("reload_retry_interval_ms", "-5"),
                ("partial_reload_shift_ms", "-5"),
            ]),
        );
        assert!(outcome.invalid.is_empty());
        let config = outcome.config;
        assert_eq!(config.partial_reload_interval_ms, MIN_LOOP_INTERVAL_MS);
        assert_eq!(config.fast_update_flush_interval_ms, MIN_LOOP_INTERVAL_MS);
        assert_eq!(config.reload_retry_interval_ms, MIN_LOOP_INTERVAL_MS);
        assert_eq!(config.partial_reload_shift_ms, 0);
        assert_eq!(config.fast_update_flush_interval(), Duration::from_millis(10));
    }

    #[test]
    fn loop_intervals_are_floored_for_configs_built_in_code() {
        let config = DynamicConfig {
            partial_reload_interval_ms: 0,
            reload_retry_interval_ms: -1,
            fast_update_flush_interval_ms: 0,
            ..DynamicConfig::default()
        };
        let floor = Duration::from_millis(MIN_LOOP_INTERVAL_MS as u64);
        assert_eq!(config.partial_reload_interval(), floor);
        assert_eq!(config.reload_retry_interval(), floor);
        assert_eq!(config.fast_update_flush_interval(), floor);
    }

    #[test]
    fn hub_notifies_only_on_change() {
        let hub = ConfigHub::new(DynamicConfig::default());
        let mut rx = hub.subscribe();
        assert!(!hub.apply(DynamicConfig::default()));
        assert!(!rx.has_changed().unwrap());

        let next = DynamicConfig {
            max_write_txns: 3,
            ..DynamicConfig::default()
        };
        assert!(hub.apply(next));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().max_write_txns, 3);
        assert_eq!(hub.current().global_limit(true), Some(3));
        assert_eq!(hub.current().global_limit(false), None);
    }
}

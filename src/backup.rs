//! # Local Backup Files
//!
//! After every successful full reload the engine writes two files into its
//! backup directory:
//!
//! - `{system}.objects.json`: every non-archived object row
//! - `{system}.config.json`: the effective dynamic config
//!
//! If the backing store is unreachable at startup, these files let the engine
//! come up read-only with the last known state.
//!
//! ## Write Protocol
//!
//! ```text
//! 1. serialize to   {file}.tmp
//! 2. rename         {file}      → {file}.bak   (keep the previous good copy)
//! 3. rename         {file}.tmp  → {file}
//! ```
//!
//! A crash at any point leaves either `{file}` or `{file}.bak` intact. Reads
//! try `{file}` first and retry once from `{file}.bak`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::DynamicConfig;
use crate::error::Result;
use crate::types::{now, StoredObject, Timestamp};

/// Contents of the object backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectBackup {
    pub saved_at: Timestamp,
    pub objects: Vec<StoredObject>,
}

/// Contents of the config backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBackup {
    pub saved_at: Timestamp,
    pub config: DynamicConfig,
}

/// Reads and writes the backup files of one engine.
#[derive(Debug, Clone)]
pub struct BackupFiles {
    objects: PathBuf,
    config: PathBuf,
}

impl BackupFiles {
    pub fn new(dir: impl AsRef<Path>, system_name: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            objects: dir.join(format!("{system_name}.objects.json")),
            config: dir.join(format!("{system_name}.config.json")),
        }
    }

    pub fn objects_path(&self) -> &Path {
        &self.objects
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    /// Writes both files. Blocking; call from a blocking context.
    pub fn save(&self, objects: Vec<StoredObject>, config: &DynamicConfig) -> Result<()> {
        let saved_at = now();
        write_atomic(&self.objects, &ObjectBackup { saved_at, objects })?;
        write_atomic(
            &self.config,
            &ConfigBackup {
                saved_at,
                config: config.clone(),
            },
        )
    }

    pub fn load_objects(&self) -> Result<ObjectBackup> {
        read_with_retry(&self.objects)
    }

    pub fn load_config(&self) -> Result<ConfigBackup> {
        read_with_retry(&self.config)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = sibling(path, ".tmp");
    let data = serde_json::to_vec(value)?;
    fs::write(&tmp, data)?;
    if path.exists() {
        fs::rename(path, sibling(path, ".bak"))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn read_with_retry<T: DeserializeOwned>(path: &Path) -> Result<T> {
    match read_file(path) {
        Ok(value) => Ok(value),
        Err(first) => {
            let bak = sibling(path, ".bak");
            warn!(path = %path.display(), error = %first, "backup file unreadable, trying previous copy");
            read_file(&bak).map_err(|_| first)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{IndexFields, Uid};

    fn row(uid: &str) -> StoredObject {
        let ts = now();
        StoredObject {
            uid: Uid::new(uid),
            origin_uid: None,
            type_name: "Host".to_string(),
            namespace: "default".to_string(),
            ver: 1,
            deleted: false,
            archive: false,
            snapshot_no: 1,
            create_dt: ts,
            update_dt: ts,
            delete_dt: None,
            keys: IndexFields::new(["a"]),
            labels: IndexFields::empty(),
            ext1: None,
            ext2: None,
            search1: None,
            search2: None,
            payload: r#"{"name":"a"}"#.to_string(),
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = BackupFiles::new(dir.path(), "sys");
        files.save(vec![row("Host-1")], &DynamicConfig::default()).unwrap();

        let objects = files.load_objects().unwrap();
        assert_eq!(objects.objects.len(), 1);
        assert_eq!(objects.objects[0].uid.as_str(), "Host-1");
        assert_eq!(files.load_config().unwrap().config, DynamicConfig::default());
    }

    #[test]
    fn second_save_keeps_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let files = BackupFiles::new(dir.path(), "sys");
        files.save(vec![row("Host-1")], &DynamicConfig::default()).unwrap();
        files
            .save(vec![row("Host-1"), row("Host-2")], &DynamicConfig::default())
            .unwrap();

        let bak = sibling(files.objects_path(), ".bak");
        let previous: ObjectBackup = read_file(&bak).unwrap();
        assert_eq!(previous.objects.len(), 1);
        assert_eq!(files.load_objects().unwrap().objects.len(), 2);
    }

    #[test]
    fn corrupt_file_falls_back_to_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let files = BackupFiles::new(dir.path(), "sys");
        files.save(vec![row("Host-1")], &DynamicConfig::default()).unwrap();
        files.save(vec![row("Host-2")], &DynamicConfig::default()).unwrap();

        fs::write(files.objects_path(), b"{ truncated").unwrap();
        let objects = files.load_objects().unwrap();
        assert_eq!(objects.objects[0].uid.as_str(), "Host-1");
    }

    #[test]
    fn missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let files = BackupFiles::new(dir.path(), "sys");
        assert!(matches!(files.load_objects(), Err(Error::Io(_))));
    }
}

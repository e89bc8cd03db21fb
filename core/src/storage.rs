//! Persistence contracts: a generic key-value store for the Config Cache's
//! cold tier, and a single-file JSON array store for Background Queues.
//! Default implementations are plain filesystem backed, matching the
//! "typical platform storage" contract described for the facade's host.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Simple key-value store, as implemented by the platform's local storage.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// File-backed KV store: one file per key, named `<key>.json`, under a
/// caller-supplied directory.
pub struct FileKvStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileKvStore {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// In-memory KV store, used in tests and as a stand-in when
/// `local_storage_enabled` is false.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<HashMap<String, String>>,
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A single-file JSON array store used by `PersistentQueue`. Writes the
/// whole array atomically via write-to-temp-then-rename, so a crash never
/// leaves a torn file behind for the next load to choke on.
pub struct QueueFileStore {
    path: PathBuf,
}

impl QueueFileStore {
    pub fn new(dir: impl AsRef<Path>, queue_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(QueueFileStore {
            path: dir.join(format!("{queue_name}.queue.json")),
        })
    }

    /// Load all records, skipping (and warning about) any that fail to
    /// deserialize rather than discarding the whole file.
    pub fn load<T: DeserializeOwned>(&self) -> Vec<T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };
        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(path = %self.path.display(), "queue file is not a JSON array, ignoring");
                return Vec::new();
            }
        };
        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<T>(value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed queue record");
                }
            }
        }
        records
    }

    pub fn persist<T: Serialize>(&self, records: &[T]) -> Result<()> {
        let serialized = serde_json::to_string(records)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let tmp = self.path.with_extension("queue.json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

//! Locally persisted copy of the last known flag set.
//!
//! [`PersistCache`] keeps a single JSON blob in a [`KeyValueStore`] under a namespaced key. The
//! entry is never versioned or invalidated; it is simply overwritten on the next successful save.
use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;

use crate::{flags::is_flags_shape, FlagSet, Result};

/// A durable string key-value store, in the spirit of browser local storage.
///
/// Calls may block; [`PersistCache`] runs them on tokio's blocking pool.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
}

/// A process-local [`KeyValueStore`]. Useful for tests and for hosts without a disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// A [`KeyValueStore`] that keeps one file per key inside a directory.
///
/// Every write goes to its own temporary file and is renamed into place, so readers never observe
/// a partially written entry and concurrent writers don't clobber each other.
///
/// File names escape every byte other than ASCII alphanumerics and `-` as `_xx` (hex), so distinct
/// keys never share a file: `cache:a` is stored in `cache_3aa.json`, `cache_a` in `cache_5fa.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> FileStore {
        FileStore { dir: dir.into() }
    }

    /// Directory holding the entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::with_capacity(key.len() + 5);
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_name.push(char::from(byte));
            } else {
                let _ = write!(file_name, "_{byte:02x}");
            }
        }
        file_name.push_str(".json");
        self.dir.join(file_name)
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(value.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.path_for(key)).map_err(|err| err.error)?;
        Ok(())
    }
}

/// Reads and writes the persisted flag set.
#[derive(Clone)]
pub struct PersistCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PersistCache {
    /// Namespace used for the storage key unless overridden.
    pub const DEFAULT_NAMESPACE: &'static str = env!("CARGO_PKG_NAME");

    /// Create a cache over `store` using [`PersistCache::DEFAULT_NAMESPACE`].
    pub fn new(store: Arc<dyn KeyValueStore>) -> PersistCache {
        PersistCache {
            store,
            key: cache_key(PersistCache::DEFAULT_NAMESPACE),
        }
    }

    /// Use `cache:<namespace>` as the storage key.
    pub fn with_namespace(mut self, namespace: &str) -> PersistCache {
        self.key = cache_key(namespace);
        self
    }

    /// The storage key entries are read from and written to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the persisted flag set.
    ///
    /// Returns `None` if the entry is missing, is not valid JSON, or is not flag-shaped. Never
    /// fails.
    pub async fn read_from_cache(&self) -> Option<FlagSet> {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let raw = match tokio::task::spawn_blocking(move || store.get_item(&key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return None,
            Ok(Err(err)) => {
                log::warn!(target: "feature_flags", key = self.key.as_str(); "failed to read persisted flags: {err}");
                return None;
            }
            Err(err) => {
                log::error!(target: "feature_flags", key = self.key.as_str(); "persisted flags read did not complete: {err}");
                return None;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                log::debug!(target: "feature_flags", "persisted flags are not valid JSON: {err}");
                return None;
            }
        };

        FlagSet::from_value(value).ok()
    }

    /// Persist `flags`.
    ///
    /// Nothing is written unless `flags` serializes to a flag-shaped object. Failures are logged
    /// and swallowed.
    pub async fn save_to_cache<T: Serialize + ?Sized>(&self, flags: &T) {
        let serialized = match serialize_flags(flags) {
            Ok(Some(serialized)) => serialized,
            Ok(None) => {
                log::debug!(target: "feature_flags", "refusing to persist a value that is not flag-shaped");
                return;
            }
            Err(err) => {
                log::error!(target: "feature_flags", key = self.key.as_str(); "failed to serialize flags: {err}");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        match tokio::task::spawn_blocking(move || store.set_item(&key, &serialized)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!(target: "feature_flags", key = self.key.as_str(); "failed to persist flags: {err}");
            }
            Err(err) => {
                log::error!(target: "feature_flags", key = self.key.as_str(); "persisting flags did not complete: {err}");
            }
        }
    }
}

/// Serialize `flags`, or `None` if they are not flag-shaped.
fn serialize_flags<T: Serialize + ?Sized>(flags: &T) -> Result<Option<String>> {
    let value = serde_json::to_value(flags)?;
    if !is_flags_shape(&value) {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&value)?))
}

fn cache_key(namespace: &str) -> String {
    format!("cache:{namespace}")
}

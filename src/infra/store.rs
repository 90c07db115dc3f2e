//! Persisted key-value state
//!
//! The engine treats persistence as a durable cache, never a source of truth.
//! Read failures and missing keys both mean "no prior value"; write failures
//! are logged and otherwise ignored.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Last good position from the sampler
pub const KEY_LAST_LOCATION: &str = "last-known-location";
/// Geofence zone list
pub const KEY_ZONES: &str = "geofence-zones";
/// Trigger phrases, sensitivity and language
pub const KEY_VOICE_SETTINGS: &str = "voice-settings";

/// Opaque string key-value store
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

/// Load and decode a JSON value; undecodable values count as absent
pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, error = %e, "store_value_undecodable");
            None
        }
    }
}

/// Encode and store a JSON value
pub fn save_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => store.set(key, json),
        Err(e) => warn!(key = %key, error = %e, "store_value_unencodable"),
    }
}

/// In-memory store, used by tests and when no path is configured
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<FxHashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values.lock().insert(key.to_string(), value);
    }
}

/// File-backed store holding every key in one JSON object
///
/// Each write rewrites the whole file through a temp file and rename so a
/// crash mid-write leaves the previous contents intact.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "store_file_corrupt");
                BTreeMap::new()
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "store_file_absent");
                BTreeMap::new()
            }
        };
        Self { path, values: Mutex::new(values) }
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        if let Err(e) = self.flush(&values) {
            warn!(path = %self.path.display(), key = %key, error = %e, "store_write_failed");
        }
    }
}

//! Durable fingerprint → remote upload mapping.
//!
//! Written when a remote session is created, read when looking for a
//! resumable transfer, cleared once the upload completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from fingerprint store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A remote transfer that may be resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUpload {
    pub file_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Uploads carrying the file, in file order. More than one means they
    /// are partial uploads still to be concatenated.
    pub parts: Vec<StoredPart>,
}

/// One remote upload and the byte range of the file it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPart {
    pub resource_url: String,
    pub offset: u64,
    pub len: u64,
}

/// Key-value store shared by every session, keyed by fingerprint.
pub trait FingerprintStore: Send + Sync {
    /// Returns the upload recorded for `fingerprint`, if any.
    fn get(&self, fingerprint: &str) -> Result<Option<StoredUpload>, StoreError>;

    /// Records (or replaces) the upload for `fingerprint`.
    fn put(&self, fingerprint: &str, upload: StoredUpload) -> Result<(), StoreError>;

    /// Forgets `fingerprint`. Removing a missing key is not an error.
    fn remove(&self, fingerprint: &str) -> Result<(), StoreError>;
}

/// Fingerprint store persisted to a JSON file.
///
/// Every operation re-reads the file so that independent processes
/// sharing the file see each other's entries; writes go through a
/// temporary file and a rename.
pub struct JsonFingerprintStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFingerprintStore {
    /// Opens the store at `path`, validating any existing content.
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let entries = load_entries(&path)?;
        debug!("loaded {} resumable upload(s) from {:?}", entries.len(), path);
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns all stored fingerprints.
    pub fn fingerprints(&self) -> Result<Vec<String>, StoreError> {
        Ok(load_entries(&self.path)?.into_keys().collect())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `f` to the on-disk map and writes it back.
    fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HashMap<String, StoredUpload>),
    {
        let _guard = self.lock();
        let mut entries = load_entries(&self.path)?;
        f(&mut entries);

        let json = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted {} resumable upload(s) to {:?}", entries.len(), self.path);
        Ok(())
    }
}

impl FingerprintStore for JsonFingerprintStore {
    fn get(&self, fingerprint: &str) -> Result<Option<StoredUpload>, StoreError> {
        Ok(load_entries(&self.path)?.remove(fingerprint))
    }

    fn put(&self, fingerprint: &str, upload: StoredUpload) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.insert(fingerprint.to_string(), upload);
        })
    }

    fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(fingerprint);
        })
    }
}

/// Loads entries from a JSON file on disk.
fn load_entries(path: &Path) -> Result<HashMap<String, StoredUpload>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_str(&data)?)
}

/// Process-local fingerprint store.
#[derive(Default)]
pub struct MemoryFingerprintStore {
    entries: RwLock<HashMap<String, StoredUpload>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    fn get(&self, fingerprint: &str) -> Result<Option<StoredUpload>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(fingerprint).cloned())
    }

    fn put(&self, fingerprint: &str, upload: StoredUpload) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(fingerprint.to_string(), upload);
        Ok(())
    }

    fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(fingerprint);
        Ok(())
    }
}

/// Returns the per-user dagflow configuration directory.
pub fn app_config_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("dagflow"))
}

/// Returns the default store path.
pub fn default_store_path() -> Option<PathBuf> {
    app_config_dir().map(|d| d.join("uploads.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

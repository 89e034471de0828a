//! JSON-file-backed key/value store with serialized read-modify-write.
//!
//! The whole map lives in memory behind an async mutex. Every mutation is
//! persisted while the mutex is still held, using a temp file and a rename so
//! a crash never leaves a half-written ledger behind:
//!
//! ```text
//! {path}.tmp  --write+fsync-->  rename  -->  {path}
//! ```

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub struct JsonFileStore<V> {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send,
{
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open (or create) a store at `path`.
    ///
    /// # Errors
    ///
    /// A file that exists but cannot be parsed is an error: starting with an
    /// empty ledger would forget completed payments.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::Storage(format!("Failed to create ledger directory {:?}: {e}", parent))
            })?;
        }
        let entries = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Storage(format!("Ledger {:?} is corrupt: {e}", path))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::Storage(format!("Failed to read ledger {:?}: {e}", path)));
            }
        };
        debug!("Opened ledger {:?} with {} entries", path, entries.len());
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Atomically read, modify and persist the value under `key`.
    ///
    /// `apply` sees the current value and returns the replacement (`None`
    /// leaves the entry untouched) plus a result handed back to the caller.
    /// If persisting fails the in-memory entry is rolled back.
    pub async fn update<R, F>(&self, key: &str, apply: F) -> Result<R>
    where
        F: FnOnce(Option<&V>) -> (Option<V>, R),
    {
        let mut entries = self.entries.lock().await;
        let previous = entries.get(key).cloned();
        let (replacement, result) = apply(previous.as_ref());
        let Some(replacement) = replacement else {
            return Ok(result);
        };
        entries.insert(key.to_string(), replacement);
        if let Err(e) = self.persist(&entries).await {
            error!("Failed to persist ledger entry {}: {}", key, e);
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(result)
    }

    async fn persist(&self, entries: &BTreeMap<String, V>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(entries)?;

        let mut temp_path = path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create temp file: {e}")))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write ledger: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("Failed to sync ledger: {e}")))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to rename temp file: {e}")))?;
        Ok(())
    }
}

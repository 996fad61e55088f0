//! Key-value persistence for scope records.
//!
//! Both stores keep the whole keyspace in memory. The file store rewrites
//! its file atomically on every mutation and restores it on open; values
//! are stored hex encoded so arbitrary bytes survive the JSON file format.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use vessel_common::{VesselError, VesselResult};

/// Durable key-value backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`.
    async fn put(&self, cancel: &CancellationToken, key: &str, value: &[u8]) -> VesselResult<()>;

    /// The value under `key`, or `KeyNotFound`.
    async fn get(&self, key: &str) -> VesselResult<Vec<u8>>;

    /// Every entry whose key matches the regular expression `pattern`.
    ///
    /// Returns `KeyNotFound` when nothing matches.
    async fn list(&self, pattern: &str) -> VesselResult<HashMap<String, Vec<u8>>>;

    /// Remove `key`, or fail with `KeyNotFound`.
    async fn delete(&self, cancel: &CancellationToken, key: &str) -> VesselResult<()>;

    /// Flush the keyspace to the backing storage.
    async fn save(&self, cancel: &CancellationToken) -> VesselResult<()>;

    /// Store name.
    fn name(&self) -> &str;
}

fn compile(pattern: &str) -> VesselResult<Regex> {
    Regex::new(pattern).map_err(|e| VesselError::invalid_config(format!("invalid key pattern {}: {}", pattern, e)))
}

fn matching(map: &BTreeMap<String, Vec<u8>>, pattern: &str) -> VesselResult<HashMap<String, Vec<u8>>> {
    let re = compile(pattern)?;
    let found: HashMap<String, Vec<u8>> = map
        .iter()
        .filter(|(k, _)| re.is_match(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if found.is_empty() {
        return Err(VesselError::KeyNotFound {
            key: pattern.to_string(),
        });
    }
    Ok(found)
}

fn check_cancelled(cancel: &CancellationToken, operation: &str) -> VesselResult<()> {
    if cancel.is_cancelled() {
        return Err(VesselError::cancelled(operation));
    }
    Ok(())
}

/// In-process store.
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    name: String,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    /// An empty store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, cancel: &CancellationToken, key: &str, value: &[u8]) -> VesselResult<()> {
        check_cancelled(cancel, "kv put")?;
        self.entries.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> VesselResult<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| VesselError::KeyNotFound { key: key.to_string() })
    }

    async fn list(&self, pattern: &str) -> VesselResult<HashMap<String, Vec<u8>>> {
        matching(&*self.entries.read().await, pattern)
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> VesselResult<()> {
        check_cancelled(cancel, "kv delete")?;
        self.entries
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| VesselError::KeyNotFound { key: key.to_string() })
    }

    async fn save(&self, cancel: &CancellationToken) -> VesselResult<()> {
        check_cancelled(cancel, "kv save")
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Store persisted to a single JSON file.
#[derive(Debug)]
pub struct FileKeyValueStore {
    name: String,
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl FileKeyValueStore {
    /// Open the store at `path`, restoring any saved entries.
    ///
    /// A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` when the file exists but cannot be read or
    /// decoded.
    pub async fn open(path: impl Into<PathBuf>) -> VesselResult<Self> {
        let path = path.into();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("kv")
            .to_string();

        let entries = Self::restore(&path).await?;
        tracing::info!(store = %name, path = %path.display(), keys = entries.len(), "Restored key value store");

        Ok(Self {
            name,
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn restore(path: &Path) -> VesselResult<BTreeMap<String, Vec<u8>>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(VesselError::persistence(format!(
                    "error reading {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let encoded: BTreeMap<String, String> = serde_json::from_str(&content).map_err(|e| {
            VesselError::persistence(format!("error decoding {}: {}", path.display(), e))
        })?;

        encoded
            .into_iter()
            .map(|(k, v)| {
                hex::decode(&v)
                    .map(|v| (k.clone(), v))
                    .map_err(|e| VesselError::persistence(format!("error decoding value of {}: {}", k, e)))
            })
            .collect()
    }

    async fn write(&self, entries: &BTreeMap<String, Vec<u8>>) -> VesselResult<()> {
        let encoded: BTreeMap<&str, String> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), hex::encode(v)))
            .collect();
        let json = serde_json::to_vec_pretty(&encoded)?;

        let persist = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = self.path.with_extension("tmp");
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };

        persist.await.map_err(|e| {
            VesselError::persistence(format!("error saving {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(store = %self.name, path = %self.path.display(), keys = entries.len(), "Saved key value store");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn put(&self, cancel: &CancellationToken, key: &str, value: &[u8]) -> VesselResult<()> {
        check_cancelled(cancel, "kv put")?;
        let mut entries = self.entries.write().await;

        let old = entries.insert(key.to_string(), value.to_vec());
        if old.as_deref() == Some(value) {
            return Ok(());
        }

        if let Err(e) = self.write(&entries).await {
            match old {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> VesselResult<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| VesselError::KeyNotFound { key: key.to_string() })
    }

    async fn list(&self, pattern: &str) -> VesselResult<HashMap<String, Vec<u8>>> {
        matching(&*self.entries.read().await, pattern)
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> VesselResult<()> {
        check_cancelled(cancel, "kv delete")?;
        let mut entries = self.entries.write().await;

        let old = entries
            .remove(key)
            .ok_or_else(|| VesselError::KeyNotFound { key: key.to_string() })?;

        if let Err(e) = self.write(&entries).await {
            entries.insert(key.to_string(), old);
            return Err(e);
        }
        Ok(())
    }

    async fn save(&self, cancel: &CancellationToken) -> VesselResult<()> {
        check_cancelled(cancel, "kv save")?;
        let entries = self.entries.read().await;
        self.write(&entries).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

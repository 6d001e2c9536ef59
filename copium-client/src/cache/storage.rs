//! Named cache stores
//!
//! [`CacheStorage`] holds any number of named stores, each a map from request
//! key to [`CachedEntry`]. Two implementations:
//! - [`MemoryStorage`]: process-lifetime stores
//! - [`DiskStorage`]: one directory per store, survives restarts

use super::classifier::CacheTier;
use crate::error::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

pub type Result<T> = std::result::Result<T, CacheError>;

/// A cached response payload, owned by exactly one store
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub request_key: String,
    pub payload: Vec<u8>,
    pub tier: CacheTier,
    pub inserted_at: DateTime<Utc>,
    pub content_type: Option<String>,
}

impl CachedEntry {
    pub fn new(request_key: impl Into<String>, payload: Vec<u8>, tier: CacheTier) -> Self {
        Self {
            request_key: request_key.into(),
            payload,
            tier,
            inserted_at: Utc::now(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Storage holding named cache stores
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Names of every existing store
    async fn store_names(&self) -> Result<Vec<String>>;

    async fn has_store(&self, store: &str) -> Result<bool> {
        Ok(self.store_names().await?.iter().any(|name| name == store))
    }

    /// Look up an entry; a missing store is a miss
    async fn get(&self, store: &str, key: &str) -> Result<Option<CachedEntry>>;

    /// Insert or replace one entry, creating the store if needed
    async fn put(&self, store: &str, entry: CachedEntry) -> Result<()> {
        self.put_all(store, vec![entry]).await
    }

    /// Insert a batch so that either every entry becomes visible or none does
    async fn put_all(&self, store: &str, entries: Vec<CachedEntry>) -> Result<()>;

    /// Delete a store and its entries; returns whether it existed
    async fn delete_store(&self, store: &str) -> Result<bool>;

    async fn keys(&self, store: &str) -> Result<Vec<String>>;

    /// Summed payload size of every entry in the store
    async fn store_size(&self, store: &str) -> Result<u64>;
}

/// In-memory stores
#[derive(Default)]
pub struct MemoryStorage {
    stores: RwLock<HashMap<String, HashMap<String, CachedEntry>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn store_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.stores.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<CachedEntry>> {
        Ok(self
            .stores
            .read()
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put_all(&self, store: &str, entries: Vec<CachedEntry>) -> Result<()> {
        let mut stores = self.stores.write();
        let target = stores.entry(store.to_string()).or_default();
        for entry in entries {
            target.insert(entry.request_key.clone(), entry);
        }
        Ok(())
    }

    async fn delete_store(&self, store: &str) -> Result<bool> {
        Ok(self.stores.write().remove(store).is_some())
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .stores
            .read()
            .get(store)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn store_size(&self, store: &str) -> Result<u64> {
        Ok(self
            .stores
            .read()
            .get(store)
            .map(|entries| entries.values().map(CachedEntry::size).sum())
            .unwrap_or(0))
    }
}

/// Index record for one entry of a disk store
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    file: String,
    size: u64,
    tier: CacheTier,
    inserted_at: DateTime<Utc>,
    #[serde(default)]
    content_type: Option<String>,
}

type StoreIndex = HashMap<String, IndexEntry>;

const INDEX_FILE: &str = "index.json";

/// Disk-backed stores
///
/// Layout: `<root>/<store>/index.json` plus one data file per entry. Data
/// files are written first and the index is replaced by rename, so a batch
/// becomes visible in a single step.
pub struct DiskStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskStorage {
    /// Open (or create) the storage root
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, store: &str) -> Result<PathBuf> {
        let valid = !store.is_empty()
            && !store.starts_with('.')
            && store
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CacheError::InvalidStoreName(store.to_string()));
        }
        Ok(self.root.join(store))
    }

    async fn load_index(dir: &Path) -> Result<Option<StoreIndex>> {
        match fs::read(dir.join(INDEX_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_index(dir: &Path, index: &StoreIndex) -> Result<()> {
        let tmp = dir.join(format!("{INDEX_FILE}.{}.tmp", uuid::Uuid::new_v4()));
        let written = match fs::write(&tmp, serde_json::to_vec(index)?).await {
            Ok(()) => fs::rename(&tmp, dir.join(INDEX_FILE)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Payload files of a batch whose index is not written yet
///
/// Dropped without [`StagedFiles::commit`], the files are removed.
struct StagedFiles {
    dir: PathBuf,
    files: Vec<String>,
}

impl StagedFiles {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            files: Vec::new(),
        }
    }

    async fn write(&mut self, payload: &[u8]) -> Result<String> {
        let file = format!("{}.bin", uuid::Uuid::new_v4());
        self.files.push(file.clone());
        fs::write(self.dir.join(&file), payload).await?;
        Ok(file)
    }

    fn commit(mut self) {
        self.files.clear();
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        if !self.files.is_empty() {
            debug!(dir = %self.dir.display(), files = self.files.len(), "Removing unindexed payloads");
        }
        for file in &self.files {
            let _ = std::fs::remove_file(self.dir.join(file));
        }
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn store_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_dir() && fs::try_exists(item.path().join(INDEX_FILE)).await? {
                names.push(item.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<CachedEntry>> {
        let dir = self.store_dir(store)?;
        let Some(index) = Self::load_index(&dir).await? else {
            return Ok(None);
        };
        let Some(record) = index.get(key) else {
            return Ok(None);
        };

        let payload = fs::read(dir.join(&record.file)).await?;
        Ok(Some(CachedEntry {
            request_key: key.to_string(),
            payload,
            tier: record.tier,
            inserted_at: record.inserted_at,
            content_type: record.content_type.clone(),
        }))
    }

    async fn put_all(&self, store: &str, entries: Vec<CachedEntry>) -> Result<()> {
        let dir = self.store_dir(store)?;
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&dir).await?;

        let mut index = Self::load_index(&dir).await?.unwrap_or_default();
        let mut replaced = Vec::new();
        let mut staged = StagedFiles::new(&dir);

        for entry in entries {
            let file = staged.write(&entry.payload).await?;
            let record = IndexEntry {
                file,
                size: entry.size(),
                tier: entry.tier,
                inserted_at: entry.inserted_at,
                content_type: entry.content_type,
            };
            if let Some(old) = index.insert(entry.request_key, record) {
                replaced.push(old.file);
            }
        }

        Self::save_index(&dir, &index).await?;
        staged.commit();

        for file in replaced {
            // Stale data files are unreachable once the index is swapped
            let _ = fs::remove_file(dir.join(file)).await;
        }

        debug!(store, entries = index.len(), "Disk store index written");
        Ok(())
    }

    async fn delete_store(&self, store: &str) -> Result<bool> {
        let dir = self.store_dir(store)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>> {
        let dir = self.store_dir(store)?;
        let mut keys: Vec<String> = Self::load_index(&dir)
            .await?
            .map(|index| index.into_keys().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn store_size(&self, store: &str) -> Result<u64> {
        let dir = self.store_dir(store)?;
        Ok(Self::load_index(&dir)
            .await?
            .map(|index| index.values().map(|r| r.size).sum())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(key: &str, payload: &[u8]) -> CachedEntry {
        CachedEntry::new(key, payload.to_vec(), CacheTier::ModelWeights)
    }

    #[tokio::test]
    async fn test_memory_put_get() {
        let storage = MemoryStorage::new();
        storage.put("models-v1", entry("a", b"abc")).await.unwrap();

        let hit = storage.get("models-v1", "a").await.unwrap().unwrap();
        assert_eq!(hit.payload, b"abc");
        assert!(storage.get("models-v1", "b").await.unwrap().is_none());
        assert!(storage.get("other", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_stores_are_isolated() {
        let storage = MemoryStorage::new();
        storage.put("shell-v1", entry("k", b"shell")).await.unwrap();
        storage.put("models-v1", entry("k", b"model")).await.unwrap();

        assert!(storage.delete_store("shell-v1").await.unwrap());
        assert!(!storage.delete_store("shell-v1").await.unwrap());
        let kept = storage.get("models-v1", "k").await.unwrap().unwrap();
        assert_eq!(kept.payload, b"model");
        assert_eq!(storage.store_names().await.unwrap(), vec!["models-v1"]);
    }

    #[tokio::test]
    async fn test_memory_store_size() {
        let storage = MemoryStorage::new();
        storage
            .put_all("models-v1", vec![entry("a", &[0; 10]), entry("b", &[0; 32])])
            .await
            .unwrap();
        assert_eq!(storage.store_size("models-v1").await.unwrap(), 42);
        assert_eq!(storage.store_size("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disk_round_trip_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = DiskStorage::open(dir.path()).await.unwrap();
            storage
                .put("copiummeter-models-v4", entry("https://hf.co/w.onnx", b"weights"))
                .await
                .unwrap();
        }

        let storage = DiskStorage::open(dir.path()).await.unwrap();
        let hit = storage
            .get("copiummeter-models-v4", "https://hf.co/w.onnx")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.payload, b"weights");
        assert_eq!(hit.tier, CacheTier::ModelWeights);
        assert_eq!(storage.store_names().await.unwrap(), vec!["copiummeter-models-v4"]);
    }

    #[tokio::test]
    async fn test_disk_overwrite_replaces_payload() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();

        storage.put("s-v1", entry("k", b"old")).await.unwrap();
        storage.put("s-v1", entry("k", b"newer")).await.unwrap();

        let hit = storage.get("s-v1", "k").await.unwrap().unwrap();
        assert_eq!(hit.payload, b"newer");
        assert_eq!(storage.store_size("s-v1").await.unwrap(), 5);
        assert_eq!(storage.keys("s-v1").await.unwrap(), vec!["k"]);
    }

    #[tokio::test]
    async fn test_disk_delete_store() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();

        storage.put("s-v1", entry("k", b"x")).await.unwrap();
        assert!(storage.delete_store("s-v1").await.unwrap());
        assert!(storage.store_names().await.unwrap().is_empty());
        assert!(storage.get("s-v1", "k").await.unwrap().is_none());
    }

    fn payload_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|item| item.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "bin"))
            .collect()
    }

    #[tokio::test]
    async fn test_disk_unindexed_payloads_are_removed() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("s-v1");
        std::fs::create_dir_all(&store).unwrap();

        {
            let mut staged = StagedFiles::new(&store);
            staged.write(b"one").await.unwrap();
            staged.write(b"two").await.unwrap();
            assert_eq!(payload_files(&store).len(), 2);
        }
        assert!(payload_files(&store).is_empty());

        let storage = DiskStorage::open(dir.path()).await.unwrap();
        storage
            .put_all("s-v1", vec![entry("a", b"one"), entry("b", b"two")])
            .await
            .unwrap();
        assert_eq!(payload_files(&store).len(), 2);
    }

    #[tokio::test]
    async fn test_disk_rejects_path_like_names() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();

        let result = storage.put("../escape", entry("k", b"x")).await;
        assert!(matches!(result, Err(CacheError::InvalidStoreName(_))));
    }
}

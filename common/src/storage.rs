//! Byte object storage.
//!
//! The engine reads text input, writes text output and spills disk-level
//! partitions through [`Storage`]; it never talks to `object_store`
//! directly. [`StorageBuilder`] picks the backend.

use async_trait::async_trait;
use futures::StreamExt;
use object_store::{
    ObjectStore, PutPayload, local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath,
};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{CommonError, ErrorContext, Result};

/// Generic storage trait for async key-value operations over byte objects.
///
/// Keys are `/`-separated object paths such as `output/part-00000`.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Get an object by key. Returns `None` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object. The write is all-or-nothing: readers never observe a
    /// partially written object.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove an object. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists.
    async fn contains_key(&self, key: &str) -> Result<bool>;

    /// List every key under the given prefix, sorted.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every key under the given prefix.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_prefix(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Get storage statistics.
    async fn stats(&self) -> StorageStats;
}

/// Storage statistics.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub read_count: u64,
    pub write_count: u64,
    pub delete_count: u64,
    pub error_count: u64,
    pub bytes_written: u64,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageBackend {
    /// Process-local, lost on drop
    #[default]
    Memory,
    /// Local filesystem storage rooted at `root_path`.
    LocalFileSystem { root_path: PathBuf },
}

/// Backend plus an optional key prefix.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Prepended to every key
    pub key_prefix: Option<String>,
}

/// Opens a [`Storage`] for a [`StorageConfig`].
pub struct StorageBuilder {
    config: StorageConfig,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self {
            config: StorageConfig::default(),
        }
    }

    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Scope every key under `prefix/`.
    pub fn key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.key_prefix = Some(prefix.into());
        self
    }

    /// Open the backend, creating a local root directory if needed.
    pub async fn build(self) -> Result<Arc<dyn Storage>> {
        let storage = ObjectStoreStorage::new(self.config).await?;
        Ok(Arc::new(storage))
    }
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free counters behind [`StorageStats`].
#[derive(Debug, Default)]
struct InternalStorageStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    bytes_written: AtomicU64,
}

impl InternalStorageStats {
    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn get_stats(&self) -> StorageStats {
        StorageStats {
            read_count: self.reads.load(Ordering::Relaxed),
            write_count: self.writes.load(Ordering::Relaxed),
            delete_count: self.deletes.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// `object_store` backed implementation of [`Storage`].
struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    config: StorageConfig,
    stats: Arc<InternalStorageStats>,
}

impl std::fmt::Debug for ObjectStoreStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreStorage")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ObjectStoreStorage {
    async fn new(config: StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match &config.backend {
            StorageBackend::Memory => Arc::new(InMemory::new()),
            StorageBackend::LocalFileSystem { root_path } => {
                tokio::fs::create_dir_all(root_path)
                    .await
                    .with_io_context(|| {
                        format!("Failed to create storage root {}", root_path.display())
                    })?;
                let fs = LocalFileSystem::new_with_prefix(root_path)
                    .with_storage_context(|| "Failed to create local filesystem storage".into())?;
                Arc::new(fs)
            }
        };

        debug!("Opened storage backend {:?}", config.backend);

        Ok(Self {
            store,
            config,
            stats: Arc::new(InternalStorageStats::default()),
        })
    }

    /// Convert a key to an object store path.
    fn key_to_path(&self, key: &str) -> ObjectPath {
        match &self.config.key_prefix {
            Some(prefix) => ObjectPath::from(format!("{}/{}", prefix, key)),
            None => ObjectPath::from(key),
        }
    }

    /// Convert an object store path back to a key.
    fn path_to_key(&self, path: &ObjectPath) -> Result<String> {
        let path_str: &str = path.as_ref();
        match &self.config.key_prefix {
            Some(prefix) => {
                let prefix_with_slash = format!("{}/", prefix);
                path_str
                    .strip_prefix(&prefix_with_slash)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CommonError::storage_error(format!(
                            "Path does not start with expected prefix: {}",
                            path_str
                        ))
                    })
            }
            None => Ok(path_str.to_string()),
        }
    }

    /// Convert object store error to CommonError.
    fn convert_error(error: object_store::Error) -> CommonError {
        CommonError::storage_error_with_source("Object store operation failed", error)
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_to_path(key);

        match self.store.get(&path).await {
            Ok(get_result) => {
                self.stats.record_read();
                let bytes = get_result.bytes().await.map_err(Self::convert_error)?;
                Ok(Some(bytes.to_vec()))
            }
            Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_read();
                Ok(None)
            }
            Err(e) => {
                self.stats.record_error();
                Err(Self::convert_error(e))
            }
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_to_path(key);
        let payload = PutPayload::from(value.to_vec());

        match self.store.put(&path, payload).await {
            Ok(_) => {
                self.stats.record_write(value.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(Self::convert_error(e))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);

        match self.store.delete(&path).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_delete();
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(Self::convert_error(e))
            }
        }
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key);

        match self.store.head(&path).await {
            Ok(_) => {
                self.stats.record_read();
                Ok(true)
            }
            Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_read();
                Ok(false)
            }
            Err(e) => {
                self.stats.record_error();
                Err(Self::convert_error(e))
            }
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = self.key_to_path(prefix);
        let mut keys = Vec::new();

        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(result) = stream.next().await {
            match result {
                Ok(object_meta) => keys.push(self.path_to_key(&object_meta.location)?),
                Err(object_store::Error::NotFound { .. }) => break,
                Err(e) => {
                    self.stats.record_error();
                    return Err(Self::convert_error(e));
                }
            }
        }

        self.stats.record_read();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self) -> StorageStats {
        self.stats.get_stats()
    }
}

/// Normalise a user facing URI such as `dbfs:/FileStore/data.txt` or
/// `file:///tmp/out` into a storage key (`FileStore/data.txt`, `tmp/out`).
pub fn normalize_uri(uri: &str) -> String {
    let without_scheme = match uri.split_once(':') {
        Some((scheme, rest))
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') =>
        {
            rest
        }
        _ => uri,
    };
    without_scheme
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage_basic_operations() {
        let storage = StorageBuilder::new()
            .backend(StorageBackend::Memory)
            .build()
            .await
            .expect("Failed to create memory storage");

        storage
            .put("test/key", b"test_value")
            .await
            .expect("Failed to put");

        let value = storage.get("test/key").await.expect("Failed to get");
        assert_eq!(value, Some(b"test_value".to_vec()));

        assert!(storage.contains_key("test/key").await.unwrap());
        assert!(!storage.contains_key("test/nonexistent").await.unwrap());

        storage.delete("test/key").await.expect("Failed to delete");
        assert_eq!(storage.get("test/key").await.unwrap(), None);

        // deleting twice is fine
        storage.delete("test/key").await.expect("Failed to delete");
    }

    #[tokio::test]
    async fn test_local_filesystem_storage() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");

        let storage = StorageBuilder::new()
            .backend(StorageBackend::LocalFileSystem {
                root_path: temp_dir.path().to_path_buf(),
            })
            .build()
            .await
            .expect("Failed to create local filesystem storage");

        storage
            .put("out/part-00000", b"hello\nworld\n")
            .await
            .expect("Failed to put");

        let on_disk = std::fs::read(temp_dir.path().join("out").join("part-00000")).unwrap();
        assert_eq!(on_disk, b"hello\nworld\n");

        let value = storage.get("out/part-00000").await.unwrap();
        assert_eq!(value, Some(b"hello\nworld\n".to_vec()));
    }

    #[tokio::test]
    async fn test_prefix_operations() {
        let storage = StorageBuilder::new().build().await.unwrap();

        storage.put("blocks/rdd_1_0", b"a").await.unwrap();
        storage.put("blocks/rdd_1_1", b"b").await.unwrap();
        storage.put("other/key", b"c").await.unwrap();

        let keys = storage.list_prefix("blocks").await.unwrap();
        assert_eq!(keys, vec!["blocks/rdd_1_0", "blocks/rdd_1_1"]);

        let removed = storage.delete_prefix("blocks").await.unwrap();
        assert_eq!(removed, 2);
        assert!(storage.list_prefix("blocks").await.unwrap().is_empty());
        assert!(storage.contains_key("other/key").await.unwrap());
    }

    #[tokio::test]
    async fn test_key_prefix_is_transparent() {
        let storage = StorageBuilder::new()
            .key_prefix("spill")
            .build()
            .await
            .unwrap();

        storage.put("rdd_3_2", b"payload").await.unwrap();
        assert_eq!(storage.list_prefix("").await.unwrap(), vec!["rdd_3_2"]);
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let storage = StorageBuilder::new().build().await.unwrap();

        storage.put("stats_key", b"stats_value").await.unwrap();
        storage.get("stats_key").await.unwrap();
        storage.delete("stats_key").await.unwrap();

        let stats = storage.stats().await;
        assert_eq!(stats.write_count, 1);
        assert_eq!(stats.bytes_written, 11);
        assert!(stats.read_count > 0);
        assert!(stats.delete_count > 0);
    }

    #[test]
    fn test_normalize_uri() {
        assert_eq!(normalize_uri("dbfs:/FileStore/data.txt"), "FileStore/data.txt");
        assert_eq!(normalize_uri("file:///tmp/out"), "tmp/out");
        assert_eq!(normalize_uri("memory://bucket/x/"), "bucket/x");
        assert_eq!(normalize_uri("./data/words.txt"), "data/words.txt");
        assert_eq!(normalize_uri("plain"), "plain");
    }
}

//! Cache manager: which datasets are marked for caching, and at what level.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::partition_store::{BlockId, PartitionStore};
use super::{CacheStats, StorageLevel};
use crate::error::{EngineError, EngineResult};
use crate::lineage::NodeId;
use crate::value::Value;

/// Tracks cache marks and fronts the partition store for the scheduler.
#[derive(Debug)]
pub struct CacheManager {
    levels: Mutex<HashMap<NodeId, StorageLevel>>,
    store: Arc<PartitionStore>,
}

impl CacheManager {
    pub fn new(store: Arc<PartitionStore>) -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
            store,
        }
    }

    fn lock_levels(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, StorageLevel>> {
        self.levels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a dataset for caching. Marking again at the same level is a
    /// no-op; a different level is rejected until the dataset is unpersisted.
    pub fn mark_for_cache(&self, node: NodeId, level: StorageLevel) -> EngineResult<()> {
        if !level.is_cached() {
            return Err(EngineError::InvalidArgument(
                "use unpersist to stop caching a dataset".to_string(),
            ));
        }
        let mut levels = self.lock_levels();
        match levels.get(&node) {
            Some(current) if *current == level => Ok(()),
            Some(current) => Err(EngineError::StorageLevelChange {
                node,
                current: *current,
                requested: level,
            }),
            None => {
                debug!("Marked dataset {} for caching at {:?}", node, level);
                levels.insert(node, level);
                Ok(())
            }
        }
    }

    pub fn storage_level(&self, node: NodeId) -> StorageLevel {
        self.lock_levels().get(&node).copied().unwrap_or_default()
    }

    pub fn is_marked(&self, node: NodeId) -> bool {
        self.lock_levels().contains_key(&node)
    }

    pub fn marked(&self) -> Vec<(NodeId, StorageLevel)> {
        let mut marked: Vec<_> = self.lock_levels().iter().map(|(n, l)| (*n, *l)).collect();
        marked.sort_by_key(|(n, _)| *n);
        marked
    }

    pub async fn is_materialized(&self, node: NodeId, partition: usize) -> bool {
        self.is_marked(node) && self.store.contains(&BlockId::new(node, partition)).await
    }

    /// Cached copy of a partition, if still held.
    pub async fn get_partition(
        &self,
        node: NodeId,
        partition: usize,
    ) -> EngineResult<Option<Arc<Vec<Value>>>> {
        if !self.is_marked(node) {
            return Ok(None);
        }
        self.store.get(&BlockId::new(node, partition)).await
    }

    /// Store a freshly computed partition of a marked dataset.
    ///
    /// Memory pressure only means the partition will be recomputed later;
    /// disk budget violations of disk-backed levels are returned.
    pub async fn put_partition(
        &self,
        node: NodeId,
        partition: usize,
        data: Arc<Vec<Value>>,
    ) -> EngineResult<()> {
        let level = self.storage_level(node);
        if !level.is_cached() {
            return Ok(());
        }
        let stored = self
            .store
            .put(BlockId::new(node, partition), data, level)
            .await?;
        if !stored {
            warn!(
                "Partition {} of dataset {} not cached, it will be recomputed",
                partition, node
            );
        }
        Ok(())
    }

    /// Remove the mark and every stored partition of a dataset.
    pub async fn unpersist(&self, node: NodeId) -> EngineResult<()> {
        let was_marked = self.lock_levels().remove(&node).is_some();
        let removed = self.store.remove_dataset(node).await?;
        if was_marked {
            info!("Unpersisted dataset {} ({} blocks freed)", node, removed);
        }
        Ok(())
    }

    pub async fn unpersist_all(&self) -> EngineResult<()> {
        self.lock_levels().clear();
        self.store.clear().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.store.stats().await
    }
}

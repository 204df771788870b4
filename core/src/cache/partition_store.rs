//! Partition store for cached datasets.
//!
//! Two tiers: a memory tier with byte accounting and LRU eviction, and a
//! disk tier written through the [`Storage`] collaborator. Metadata of each
//! tier sits behind its own lock; record payloads are handed out as shared
//! references so readers never hold a lock while using them.

use std::collections::HashMap;
use std::sync::Arc;

use ember_common::{BlockCodec, Storage, serialization};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CacheStats, StorageLevel};
use crate::error::{EngineError, EngineResult};
use crate::lineage::NodeId;
use crate::value::Value;

/// Unique identifier for a cached block
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct BlockId {
    pub dataset: NodeId,
    pub partition: usize,
}

impl BlockId {
    pub fn new(dataset: NodeId, partition: usize) -> Self {
        Self { dataset, partition }
    }

    fn storage_key(&self) -> String {
        format!("rdd_{}_{}", self.dataset.0, self.partition)
    }
}

#[derive(Debug, Clone)]
enum MemoryBlock {
    Deserialized(Arc<Vec<Value>>),
    Serialized(Arc<Vec<u8>>),
}

#[derive(Debug)]
struct CachedBlock {
    block: MemoryBlock,
    level: StorageLevel,
    size_bytes: usize,
    last_access: u64,
}

#[derive(Debug, Default)]
struct MemoryTier {
    blocks: HashMap<BlockId, CachedBlock>,
    used: usize,
    tick: u64,
}

impl MemoryTier {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, id: &BlockId) -> Option<CachedBlock> {
        let block = self.blocks.remove(id)?;
        self.used = self.used.saturating_sub(block.size_bytes);
        Some(block)
    }

    /// Remove least recently used blocks until `incoming` more bytes fit.
    fn evict_for(&mut self, incoming: usize, budget: usize) -> Vec<(BlockId, CachedBlock)> {
        let mut victims = Vec::new();
        while self.used + incoming > budget {
            let oldest = self
                .blocks
                .iter()
                .min_by_key(|(_, block)| block.last_access)
                .map(|(id, _)| *id);
            match oldest.and_then(|id| self.remove(&id).map(|b| (id, b))) {
                Some(victim) => victims.push(victim),
                None => break,
            }
        }
        victims
    }
}

#[derive(Debug, Default)]
struct DiskTier {
    sizes: HashMap<BlockId, usize>,
    used: usize,
}

/// Holds materialized partitions of cached datasets.
pub struct PartitionStore {
    memory: Mutex<MemoryTier>,
    disk: Mutex<DiskTier>,
    storage: Arc<dyn Storage>,
    codec: BlockCodec,
    memory_budget: usize,
    disk_budget: Option<usize>,
    stats: Mutex<CacheStats>,
}

impl std::fmt::Debug for PartitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStore")
            .field("memory_budget", &self.memory_budget)
            .field("disk_budget", &self.disk_budget)
            .finish()
    }
}

impl PartitionStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: BlockCodec,
        memory_budget: usize,
        disk_budget: Option<usize>,
    ) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::default()),
            disk: Mutex::new(DiskTier::default()),
            storage,
            codec,
            memory_budget,
            disk_budget,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    fn encode(&self, data: &[Value]) -> EngineResult<Vec<u8>> {
        let bytes = serialization::encode(data)?;
        Ok(self.codec.encode(&bytes)?)
    }

    fn decode(&self, block: &[u8]) -> EngineResult<Vec<Value>> {
        let bytes = self.codec.decode(block)?;
        Ok(serialization::decode(&bytes)?)
    }

    /// Store a partition at the given level.
    ///
    /// Returns whether the block is now held by either tier. A block that
    /// does not fit in memory is dropped for memory-only levels; disk-backed
    /// levels surface [`EngineError::StorageBudgetExceeded`]. Blocks evicted
    /// later and refused by the disk budget while spilling are only logged
    /// and get recomputed.
    pub async fn put(
        &self,
        id: BlockId,
        data: Arc<Vec<Value>>,
        level: StorageLevel,
    ) -> EngineResult<bool> {
        if !level.is_cached() {
            return Ok(false);
        }

        if level.use_memory() {
            let block = if level.use_serialization() {
                MemoryBlock::Serialized(Arc::new(self.encode(&data)?))
            } else {
                MemoryBlock::Deserialized(data.clone())
            };
            let size = match &block {
                MemoryBlock::Serialized(bytes) => bytes.len(),
                MemoryBlock::Deserialized(values) => {
                    values.iter().map(Value::estimated_size).sum()
                }
            };

            if let Some(victims) = self.put_memory(id, block, level, size).await {
                self.spill(victims).await;
                return Ok(true);
            }
            if !level.use_disk() {
                return Ok(false);
            }
        }

        self.put_disk(id, &data).await?;
        Ok(true)
    }

    /// Insert into the memory tier. `None` when the block alone exceeds the
    /// budget; otherwise the evicted blocks.
    async fn put_memory(
        &self,
        id: BlockId,
        block: MemoryBlock,
        level: StorageLevel,
        size: usize,
    ) -> Option<Vec<(BlockId, CachedBlock)>> {
        if size > self.memory_budget {
            debug!(
                "Block {:?} of {} bytes exceeds memory budget {}",
                id, size, self.memory_budget
            );
            self.stats.lock().await.rejected_partitions += 1;
            return None;
        }

        let mut memory = self.memory.lock().await;
        memory.remove(&id);
        let victims = memory.evict_for(size, self.memory_budget);
        let last_access = memory.next_tick();
        memory.blocks.insert(
            id,
            CachedBlock {
                block,
                level,
                size_bytes: size,
                last_access,
            },
        );
        memory.used += size;
        let used = memory.used;
        drop(memory);

        let mut stats = self.stats.lock().await;
        stats.cached_partitions += 1;
        stats.evicted_partitions += victims.len() as u64;
        stats.memory_used = used as u64;
        for (victim, _) in &victims {
            debug!("Evicted block {:?} from memory", victim);
        }
        Some(victims)
    }

    /// Write evicted blocks of disk-backed levels to disk. Failures only
    /// lose the cached copy.
    async fn spill(&self, victims: Vec<(BlockId, CachedBlock)>) {
        for (id, victim) in victims {
            if !victim.level.use_disk() {
                continue;
            }
            let data = match victim.block {
                MemoryBlock::Deserialized(values) => values,
                MemoryBlock::Serialized(bytes) => match self.decode(&bytes) {
                    Ok(values) => Arc::new(values),
                    Err(e) => {
                        warn!("Dropping evicted block {:?}: {}", id, e);
                        continue;
                    }
                },
            };
            if let Err(e) = self.put_disk(id, &data).await {
                warn!("Failed to spill block {:?}: {}", id, e);
            }
        }
    }

    async fn put_disk(&self, id: BlockId, data: &[Value]) -> EngineResult<()> {
        let bytes = self.encode(data)?;

        // reserve space first so concurrent writers see the budget
        let used = {
            let mut disk = self.disk.lock().await;
            let previous = disk.sizes.get(&id).copied().unwrap_or(0);
            let base = disk.used - previous;
            if let Some(budget) = self.disk_budget {
                if base + bytes.len() > budget {
                    return Err(EngineError::StorageBudgetExceeded {
                        needed: bytes.len(),
                        available: budget.saturating_sub(base),
                    });
                }
            }
            disk.used = base + bytes.len();
            disk.sizes.insert(id, bytes.len());
            disk.used
        };

        if let Err(e) = self.storage.put(&id.storage_key(), &bytes).await {
            let mut disk = self.disk.lock().await;
            if let Some(size) = disk.sizes.remove(&id) {
                disk.used = disk.used.saturating_sub(size);
            }
            return Err(e.into());
        }

        let mut stats = self.stats.lock().await;
        stats.disk_used = used as u64;
        debug!("Wrote block {:?} to disk ({} bytes)", id, bytes.len());
        Ok(())
    }

    /// Fetch a partition from memory, then disk.
    pub async fn get(&self, id: &BlockId) -> EngineResult<Option<Arc<Vec<Value>>>> {
        let memory_hit = {
            let mut memory = self.memory.lock().await;
            let tick = memory.next_tick();
            memory.blocks.get_mut(id).map(|block| {
                block.last_access = tick;
                block.block.clone()
            })
        };

        if let Some(block) = memory_hit {
            let data = match block {
                MemoryBlock::Deserialized(values) => values,
                MemoryBlock::Serialized(bytes) => Arc::new(self.decode(&bytes)?),
            };
            self.stats.lock().await.hits += 1;
            return Ok(Some(data));
        }

        let on_disk = self.disk.lock().await.sizes.contains_key(id);
        if on_disk {
            if let Some(bytes) = self.storage.get(&id.storage_key()).await? {
                let data = Arc::new(self.decode(&bytes)?);
                self.stats.lock().await.hits += 1;
                return Ok(Some(data));
            }
        }

        self.stats.lock().await.misses += 1;
        Ok(None)
    }

    pub async fn contains(&self, id: &BlockId) -> bool {
        if self.memory.lock().await.blocks.contains_key(id) {
            return true;
        }
        self.disk.lock().await.sizes.contains_key(id)
    }

    /// Drop a block from both tiers.
    pub async fn evict(&self, id: &BlockId) -> EngineResult<()> {
        let memory_used = {
            let mut memory = self.memory.lock().await;
            memory.remove(id);
            memory.used
        };

        let (was_on_disk, disk_used) = {
            let mut disk = self.disk.lock().await;
            let size = disk.sizes.remove(id);
            if let Some(size) = size {
                disk.used = disk.used.saturating_sub(size);
            }
            (size.is_some(), disk.used)
        };
        if was_on_disk {
            self.storage.delete(&id.storage_key()).await?;
        }

        let mut stats = self.stats.lock().await;
        stats.memory_used = memory_used as u64;
        stats.disk_used = disk_used as u64;
        Ok(())
    }

    /// Drop every block of a dataset. Returns the number of blocks removed.
    pub async fn remove_dataset(&self, dataset: NodeId) -> EngineResult<usize> {
        let mut ids: Vec<BlockId> = self
            .memory
            .lock()
            .await
            .blocks
            .keys()
            .filter(|id| id.dataset == dataset)
            .copied()
            .collect();
        let on_disk: Vec<BlockId> = self
            .disk
            .lock()
            .await
            .sizes
            .keys()
            .filter(|id| id.dataset == dataset)
            .copied()
            .collect();
        for id in on_disk {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        for id in &ids {
            self.evict(id).await?;
        }
        Ok(ids.len())
    }

    /// Drop everything.
    pub async fn clear(&self) -> EngineResult<()> {
        *self.memory.lock().await = MemoryTier::default();
        let keys: Vec<BlockId> = {
            let mut disk = self.disk.lock().await;
            let keys = disk.sizes.keys().copied().collect();
            *disk = DiskTier::default();
            keys
        };
        for id in keys {
            self.storage.delete(&id.storage_key()).await?;
        }

        let mut stats = self.stats.lock().await;
        stats.memory_used = 0;
        stats.disk_used = 0;
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::{CompressionAlgorithm, StorageBuilder};

    async fn store(memory_budget: usize, disk_budget: Option<usize>) -> PartitionStore {
        let storage = StorageBuilder::new().build().await.unwrap();
        PartitionStore::new(
            storage,
            BlockCodec::new(CompressionAlgorithm::Lz4, 64),
            memory_budget,
            disk_budget,
        )
    }

    fn partition(n: i64) -> Arc<Vec<Value>> {
        Arc::new((0..n).map(Value::from).collect())
    }

    fn block_size(n: i64) -> usize {
        partition(n).iter().map(Value::estimated_size).sum()
    }

    #[tokio::test]
    async fn test_put_and_get_memory() {
        let store = store(1 << 20, None).await;
        let id = BlockId::new(NodeId(1), 0);

        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.put(id, partition(10), StorageLevel::MemoryOnly).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap(), Some(partition(10)));

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.memory_used > 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_used_blocks() {
        // room for exactly two blocks
        let store = store(block_size(10) * 2, None).await;
        let a = BlockId::new(NodeId(1), 0);
        let b = BlockId::new(NodeId(1), 1);
        let c = BlockId::new(NodeId(1), 2);

        store.put(a, partition(10), StorageLevel::MemoryOnly).await.unwrap();
        store.put(b, partition(10), StorageLevel::MemoryOnly).await.unwrap();
        // touch a, so b is the least recently used
        store.get(&a).await.unwrap();
        store.put(c, partition(10), StorageLevel::MemoryOnly).await.unwrap();

        assert!(store.contains(&a).await);
        assert!(!store.contains(&b).await);
        assert!(store.contains(&c).await);
        assert_eq!(store.stats().await.evicted_partitions, 1);
    }

    #[tokio::test]
    async fn test_oversized_block_is_not_admitted() {
        let store = store(16, None).await;
        let id = BlockId::new(NodeId(2), 0);
        assert!(!store.put(id, partition(100), StorageLevel::MemoryOnly).await.unwrap());
        assert!(!store.contains(&id).await);
        assert_eq!(store.stats().await.rejected_partitions, 1);
    }

    #[tokio::test]
    async fn test_memory_and_disk_spills_evicted_blocks() {
        let store = store(block_size(10), None).await;
        let a = BlockId::new(NodeId(3), 0);
        let b = BlockId::new(NodeId(3), 1);

        store.put(a, partition(10), StorageLevel::MemoryAndDisk).await.unwrap();
        store.put(b, partition(10), StorageLevel::MemoryAndDisk).await.unwrap();

        // a was evicted from memory but spilled
        assert_eq!(store.get(&a).await.unwrap(), Some(partition(10)));
        assert!(store.stats().await.disk_used > 0);
    }

    #[tokio::test]
    async fn test_spill_over_disk_budget_drops_block() {
        let store = store(block_size(10), Some(8)).await;
        let a = BlockId::new(NodeId(3), 0);
        let b = BlockId::new(NodeId(3), 1);

        assert!(store.put(a, partition(10), StorageLevel::MemoryAndDisk).await.unwrap());
        // evicting a cannot spill it, the put itself still succeeds
        assert!(store.put(b, partition(10), StorageLevel::MemoryAndDisk).await.unwrap());

        assert!(store.get(&a).await.unwrap().is_none());
        assert_eq!(store.get(&b).await.unwrap(), Some(partition(10)));
        assert_eq!(store.stats().await.disk_used, 0);
    }

    #[tokio::test]
    async fn test_serialized_level_round_trips() {
        let store = store(1 << 20, None).await;
        let id = BlockId::new(NodeId(4), 0);
        let data = Arc::new(vec![Value::pair("test2", 3), Value::pair("test7", 1)]);
        store.put(id, data.clone(), StorageLevel::MemoryOnlySer).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_disk_budget_is_surfaced() {
        let store = store(1 << 20, Some(8)).await;
        let id = BlockId::new(NodeId(5), 0);
        let err = store
            .put(id, partition(100), StorageLevel::DiskOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageBudgetExceeded { .. }));
        assert!(!store.contains(&id).await);
    }

    #[tokio::test]
    async fn test_remove_dataset() {
        let store = store(1 << 20, None).await;
        for p in 0..3 {
            store
                .put(BlockId::new(NodeId(6), p), partition(5), StorageLevel::MemoryOnly)
                .await
                .unwrap();
        }
        store
            .put(BlockId::new(NodeId(6), 3), partition(5), StorageLevel::DiskOnly)
            .await
            .unwrap();
        store
            .put(BlockId::new(NodeId(7), 0), partition(5), StorageLevel::MemoryOnly)
            .await
            .unwrap();

        assert_eq!(store.remove_dataset(NodeId(6)).await.unwrap(), 4);
        assert!(!store.contains(&BlockId::new(NodeId(6), 0)).await);
        assert!(store.contains(&BlockId::new(NodeId(7), 0)).await);
        assert_eq!(store.stats().await.disk_used, 0);
    }
}

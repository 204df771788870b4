//! Caching: storage levels, the partition store and the cache manager.

pub mod manager;
pub mod partition_store;
pub mod storage_level;

pub use manager::CacheManager;
pub use partition_store::{BlockId, PartitionStore};
pub use storage_level::{CacheStats, StorageLevel};

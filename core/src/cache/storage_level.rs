//! Storage levels for dataset caching

use serde::{Deserialize, Serialize};

/// Defines how a dataset should be cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StorageLevel {
    /// No caching
    #[default]
    None,
    /// Cache in memory only
    MemoryOnly,
    /// Cache in memory only, with serialization
    MemoryOnlySer,
    /// Cache in memory, spill to disk if memory is full
    MemoryAndDisk,
    /// Cache in memory and disk, with serialization
    MemoryAndDiskSer,
    /// Cache on disk only
    DiskOnly,
}

impl StorageLevel {
    /// Check if this storage level uses memory
    pub fn use_memory(&self) -> bool {
        matches!(
            self,
            StorageLevel::MemoryOnly
                | StorageLevel::MemoryOnlySer
                | StorageLevel::MemoryAndDisk
                | StorageLevel::MemoryAndDiskSer
        )
    }

    /// Check if this storage level uses disk
    pub fn use_disk(&self) -> bool {
        matches!(
            self,
            StorageLevel::DiskOnly | StorageLevel::MemoryAndDisk | StorageLevel::MemoryAndDiskSer
        )
    }

    /// Check if memory blocks are kept serialized
    pub fn use_serialization(&self) -> bool {
        matches!(
            self,
            StorageLevel::MemoryOnlySer | StorageLevel::MemoryAndDiskSer
        )
    }

    /// Check if caching is enabled
    pub fn is_cached(&self) -> bool {
        !matches!(self, StorageLevel::None)
    }

    /// Parse the conventional upper-case names, e.g. `MEMORY_AND_DISK`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Some(StorageLevel::None),
            "MEMORY_ONLY" => Some(StorageLevel::MemoryOnly),
            "MEMORY_ONLY_SER" => Some(StorageLevel::MemoryOnlySer),
            "MEMORY_AND_DISK" => Some(StorageLevel::MemoryAndDisk),
            "MEMORY_AND_DISK_SER" => Some(StorageLevel::MemoryAndDiskSer),
            "DISK_ONLY" => Some(StorageLevel::DiskOnly),
            _ => None,
        }
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Total memory used by cache (in bytes)
    pub memory_used: u64,
    /// Total disk used by cache (in bytes)
    pub disk_used: u64,
    /// Number of cached partitions
    pub cached_partitions: u64,
    /// Number of evicted partitions
    pub evicted_partitions: u64,
    /// Blocks refused because they exceed the memory budget on their own
    pub rejected_partitions: u64,
}

impl CacheStats {
    /// Calculate cache hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_flags() {
        assert!(!StorageLevel::None.is_cached());
        assert!(StorageLevel::MemoryOnly.use_memory());
        assert!(!StorageLevel::MemoryOnly.use_disk());
        assert!(StorageLevel::MemoryAndDisk.use_disk());
        assert!(StorageLevel::MemoryAndDiskSer.use_serialization());
        assert!(!StorageLevel::DiskOnly.use_memory());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            StorageLevel::from_name("memory_and_disk"),
            Some(StorageLevel::MemoryAndDisk)
        );
        assert_eq!(StorageLevel::from_name("DISK_ONLY"), Some(StorageLevel::DiskOnly));
        assert_eq!(StorageLevel::from_name("OFF_HEAP"), None);
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_ratio(), 0.75);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}

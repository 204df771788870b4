//! Engine configuration.

use ember_common::{CommonError, CompressionAlgorithm};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Policy used to pick memory blocks for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
}

/// Configuration for an [`EmberContext`](crate::EmberContext).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name, used in logs
    pub app_name: String,
    /// Size of the worker pool
    pub num_workers: usize,
    /// Partitions used by sources and shuffles when none are given
    pub default_partition_count: usize,
    /// Memory budget of the partition store
    pub memory_budget_bytes: usize,
    pub cache_eviction_policy: EvictionPolicy,
    /// Shuffle blocks above this size are compressed
    pub shuffle_block_size_hint: usize,
    pub block_compression: CompressionAlgorithm,
    /// Maximum number of times a task will be retried on failure
    pub task_max_retries: u32,
    /// Optional budget for disk-level persistence
    pub disk_budget_bytes: Option<usize>,
    /// Directory for disk-level partitions; a temporary directory otherwise
    pub spill_dir: Option<PathBuf>,
    /// Local root for text input and output; in-memory storage otherwise
    pub storage_root: Option<PathBuf>,
    /// Keys sampled per partition when building a range partitioner
    pub sort_sample_per_partition: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "ember".to_string(),
            num_workers: num_cpus::get(),
            default_partition_count: num_cpus::get().max(2),
            memory_budget_bytes: 256 * 1024 * 1024, // 256MB
            cache_eviction_policy: EvictionPolicy::Lru,
            shuffle_block_size_hint: 64 * 1024, // 64KB
            block_compression: CompressionAlgorithm::Lz4,
            task_max_retries: 3,
            disk_budget_bytes: None,
            spill_dir: None,
            storage_root: None,
            sort_sample_per_partition: 20,
        }
    }
}

impl EngineConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_default_partition_count(mut self, partitions: usize) -> Self {
        self.default_partition_count = partitions;
        self
    }

    pub fn with_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn with_shuffle_block_size_hint(mut self, bytes: usize) -> Self {
        self.shuffle_block_size_hint = bytes;
        self
    }

    pub fn with_block_compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.block_compression = algorithm;
        self
    }

    pub fn with_task_max_retries(mut self, retries: u32) -> Self {
        self.task_max_retries = retries;
        self
    }

    pub fn with_disk_budget_bytes(mut self, bytes: usize) -> Self {
        self.disk_budget_bytes = Some(bytes);
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn with_sort_sample_per_partition(mut self, samples: usize) -> Self {
        self.sort_sample_per_partition = samples;
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, CommonError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            CommonError::configuration_error_with_source("Failed to parse engine config", e)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CommonError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CommonError::io_error_with_source(format!("Failed to read {}", path.display()), e)
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), CommonError> {
        if self.num_workers == 0 {
            return Err(CommonError::configuration_error(
                "num_workers must be at least 1",
            ));
        }
        if self.default_partition_count == 0 {
            return Err(CommonError::configuration_error(
                "default_partition_count must be at least 1",
            ));
        }
        if self.sort_sample_per_partition == 0 {
            return Err(CommonError::configuration_error(
                "sort_sample_per_partition must be at least 1",
            ));
        }
        Ok(())
    }
}

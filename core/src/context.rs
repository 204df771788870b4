//! EmberContext - entry point of an ember application
//!
//! The context owns the lineage graph, the worker pool, the shuffle engine,
//! the cache and the storage collaborators. Datasets created from it share
//! all of them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use ember_common::{BlockCodec, ErrorContext, Storage, StorageBackend, StorageBuilder};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheManager, CacheStats, PartitionStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lineage::{LineageGraph, NodeKind};
use crate::rdd::Rdd;
use crate::scheduler::{ActionKind, ActionResult, DagScheduler, RayonWorkerPool, WorkerPool};
use crate::shuffle::{ShuffleEngine, ShuffleStats};
use crate::value::Value;

/// Local execution context for datasets.
#[derive(Debug)]
pub struct EmberContext {
    config: EngineConfig,
    graph: Arc<LineageGraph>,
    shuffle_engine: Arc<ShuffleEngine>,
    cache: Arc<CacheManager>,
    scheduler: DagScheduler,
    storage: Arc<dyn Storage>,
    // replaced after cancel_all, kept cancelled after stop
    cancel: Mutex<CancellationToken>,
    stopped: AtomicBool,
    // removed on drop
    _spill_dir: Option<TempDir>,
}

impl EmberContext {
    /// Create a context from a validated configuration.
    pub async fn new(config: EngineConfig) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let storage = match &config.storage_root {
            Some(root) => {
                StorageBuilder::new()
                    .backend(StorageBackend::LocalFileSystem {
                        root_path: root.clone(),
                    })
                    .build()
                    .await?
            }
            None => StorageBuilder::new().build().await?,
        };

        let (spill_path, spill_dir): (PathBuf, Option<TempDir>) = match &config.spill_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let dir = TempDir::with_prefix("ember-spill-")
                    .with_io_context(|| "Failed to create spill directory".into())?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        let spill = StorageBuilder::new()
            .backend(StorageBackend::LocalFileSystem {
                root_path: spill_path.clone(),
            })
            .build()
            .await?;

        let store = Arc::new(PartitionStore::new(
            spill,
            BlockCodec::new(config.block_compression, config.shuffle_block_size_hint),
            config.memory_budget_bytes,
            config.disk_budget_bytes,
        ));
        let cache = Arc::new(CacheManager::new(store));
        let graph = Arc::new(LineageGraph::new());
        let shuffle_engine = Arc::new(ShuffleEngine::new(
            config.block_compression,
            config.shuffle_block_size_hint,
        ));
        let pool: Arc<dyn WorkerPool> = Arc::new(RayonWorkerPool::new(config.num_workers)?);
        let scheduler = DagScheduler::new(
            graph.clone(),
            shuffle_engine.clone(),
            cache.clone(),
            pool,
            storage.clone(),
            config.task_max_retries,
            config.sort_sample_per_partition,
        );

        info!(
            "Started context {} with {} workers, spilling to {}",
            config.app_name,
            config.num_workers,
            spill_path.display()
        );
        Ok(Arc::new(Self {
            config,
            graph,
            shuffle_engine,
            cache,
            scheduler,
            storage,
            cancel: Mutex::new(CancellationToken::new()),
            stopped: AtomicBool::new(false),
            _spill_dir: spill_dir,
        }))
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_partition_count(&self) -> usize {
        self.config.default_partition_count
    }

    pub(crate) fn graph(&self) -> &LineageGraph {
        &self.graph
    }

    pub(crate) fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Storage used for text input and output.
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Dataset over in-memory values, split into the default number of partitions.
    pub fn parallelize<T: Into<Value>>(self: &Arc<Self>, data: Vec<T>) -> Rdd {
        self.parallelize_with_partitions(data, self.default_partition_count())
    }

    /// Dataset over in-memory values in `num_partitions` contiguous slices.
    pub fn parallelize_with_partitions<T: Into<Value>>(
        self: &Arc<Self>,
        data: Vec<T>,
        num_partitions: usize,
    ) -> Rdd {
        let n = num_partitions.max(1);
        let mut values: Vec<Value> = data.into_iter().map(Into::into).collect();
        let len = values.len();
        let mut slices = Vec::with_capacity(n);
        for i in (0..n).rev() {
            slices.push(values.split_off(i * len / n));
        }
        slices.reverse();

        let id = self
            .graph
            .append(NodeKind::Parallelize { slices: Arc::new(slices) }, vec![], n);
        debug!("Created dataset {} from {} values", id, len);
        Rdd::new(self.clone(), id, n)
    }

    /// Dataset over the lines of a stored text object. Nothing is read
    /// until an action runs.
    pub fn text_file(self: &Arc<Self>, uri: &str) -> Rdd {
        self.text_file_with_partitions(uri, self.default_partition_count().min(2))
    }

    pub fn text_file_with_partitions(self: &Arc<Self>, uri: &str, num_partitions: usize) -> Rdd {
        let n = num_partitions.max(1);
        let id = self.graph.append(
            NodeKind::TextFile {
                path: uri.to_string(),
            },
            vec![],
            n,
        );
        Rdd::new(self.clone(), id, n)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token of the current session generation. It is cancelled by the next
    /// [`cancel_all`](Self::cancel_all) or by [`stop`](Self::stop).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.lock_cancel().clone()
    }

    /// Cancel every running action. Actions started afterwards run normally.
    pub fn cancel_all(&self) {
        info!("Cancelling all jobs of {}", self.config.app_name);
        let mut token = self.lock_cancel();
        token.cancel();
        if !self.is_stopped() {
            *token = CancellationToken::new();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the context: running actions are cancelled, cached data and
    /// shuffle state are dropped and later actions fail.
    pub async fn stop(&self) -> EngineResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.lock_cancel().cancel();
        self.cache.unpersist_all().await?;
        self.shuffle_engine.clear();
        info!("Stopped context {}", self.config.app_name);
        Ok(())
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn shuffle_stats(&self) -> ShuffleStats {
        self.shuffle_engine.stats()
    }

    pub(crate) async fn run_action(
        &self,
        target: crate::lineage::NodeId,
        action: ActionKind,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<ActionResult> {
        if self.is_stopped() {
            return Err(EngineError::ContextStopped);
        }
        // a caller token and the session token both cancel the job
        let token = match cancel {
            Some(token) => {
                let child = token.child_token();
                let session = self.cancellation_token();
                let linked = child.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = session.cancelled() => linked.cancel(),
                        _ = linked.cancelled() => {}
                    }
                });
                child
            }
            None => self.lock_cancel().child_token(),
        };
        let result = self.scheduler.run_action(target, action, &token).await;
        // releases the watcher task
        token.cancel();
        result
    }
}

//! Shuffle engine.
//!
//! Map tasks buffer and encode their buckets fully before publishing, so a
//! reader only ever sees whole blocks. A shuffle becomes readable when the
//! scheduler marks it complete at the stage barrier; an aborted shuffle
//! drops whatever was published and rejects further writes and reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ember_common::{BlockCodec, CompressionAlgorithm, serialization};
use tracing::{debug, info, warn};

use super::partitioner::{Partitioner, RoundRobinPartitioner};
use crate::error::{EngineError, EngineResult, TaskError, TaskErrorKind};
use crate::value::Value;

/// Identifier of one registered shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShuffleId(pub usize);

/// Encoded output of one map task, keyed by target partition.
/// Empty buckets have no block.
#[derive(Debug, Default)]
pub struct MapOutput {
    pub blocks: BTreeMap<usize, Arc<Vec<u8>>>,
}

impl MapOutput {
    pub fn total_bytes(&self) -> usize {
        self.blocks.values().map(|b| b.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShuffleStatus {
    Writing,
    Complete,
    Aborted,
}

#[derive(Debug)]
struct ShuffleState {
    num_reduces: usize,
    outputs: Vec<Option<MapOutput>>,
    status: ShuffleStatus,
}

/// Shuffle statistics.
#[derive(Debug, Clone, Default)]
pub struct ShuffleStats {
    pub registered: usize,
    pub active: usize,
    pub blocks_published: u64,
    pub bytes_published: u64,
    pub aborted: u64,
}

/// Holds map outputs of in-flight shuffles.
#[derive(Debug)]
pub struct ShuffleEngine {
    next_id: AtomicUsize,
    shuffles: Mutex<HashMap<ShuffleId, ShuffleState>>,
    codec: BlockCodec,
    block_size_hint: usize,
    stats: Mutex<ShuffleStats>,
}

impl ShuffleEngine {
    pub fn new(compression: CompressionAlgorithm, block_size_hint: usize) -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            shuffles: Mutex::new(HashMap::new()),
            codec: BlockCodec::new(compression, block_size_hint),
            block_size_hint,
            stats: Mutex::new(ShuffleStats::default()),
        }
    }

    fn lock_shuffles(&self) -> std::sync::MutexGuard<'_, HashMap<ShuffleId, ShuffleState>> {
        self.shuffles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, ShuffleStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a shuffle with `num_maps` writers and `num_reduces` targets.
    pub fn register(&self, num_maps: usize, num_reduces: usize) -> ShuffleId {
        let id = ShuffleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock_shuffles().insert(
            id,
            ShuffleState {
                num_reduces,
                outputs: (0..num_maps).map(|_| None).collect(),
                status: ShuffleStatus::Writing,
            },
        );
        self.lock_stats().registered += 1;
        debug!(
            "Registered shuffle {} with {} maps and {} reduces",
            id.0, num_maps, num_reduces
        );
        id
    }

    /// Encode buckets into blocks. Nothing is visible until [`publish`].
    ///
    /// [`publish`]: ShuffleEngine::publish
    pub fn shuffle_write(&self, buckets: Vec<Vec<Value>>) -> Result<MapOutput, TaskError> {
        let mut output = MapOutput::default();
        for (target, records) in buckets.into_iter().enumerate() {
            if records.is_empty() {
                continue;
            }
            let encoded = serialization::encode(&records)
                .and_then(|bytes| self.codec.encode(&bytes))
                .map_err(|e| TaskError::new("shuffleWrite", TaskErrorKind::Storage(e.to_string())))?;
            output.blocks.insert(target, Arc::new(encoded));
        }
        Ok(output)
    }

    /// Make the output of one map task visible to the stage barrier.
    pub fn publish(&self, shuffle: ShuffleId, map_index: usize, output: MapOutput) -> EngineResult<()> {
        let mut shuffles = self.lock_shuffles();
        let state = shuffles
            .get_mut(&shuffle)
            .ok_or(EngineError::ShuffleWriteAborted { shuffle: shuffle.0 })?;
        if state.status == ShuffleStatus::Aborted {
            return Err(EngineError::ShuffleWriteAborted { shuffle: shuffle.0 });
        }
        let slot = state.outputs.get_mut(map_index).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "map index {} out of range for shuffle {}",
                map_index, shuffle.0
            ))
        })?;

        let blocks = output.blocks.len() as u64;
        let bytes = output.total_bytes() as u64;
        *slot = Some(output);
        drop(shuffles);

        let mut stats = self.lock_stats();
        stats.blocks_published += blocks;
        stats.bytes_published += bytes;
        Ok(())
    }

    /// Stage barrier: every map output must be published.
    pub fn mark_complete(&self, shuffle: ShuffleId) -> EngineResult<()> {
        let mut shuffles = self.lock_shuffles();
        let state = shuffles
            .get_mut(&shuffle)
            .ok_or(EngineError::ShuffleWriteAborted { shuffle: shuffle.0 })?;
        if state.status == ShuffleStatus::Aborted {
            return Err(EngineError::ShuffleWriteAborted { shuffle: shuffle.0 });
        }
        if let Some(missing) = state.outputs.iter().position(Option::is_none) {
            return Err(EngineError::InvalidArgument(format!(
                "shuffle {} map output {} was never published",
                shuffle.0, missing
            )));
        }
        state.status = ShuffleStatus::Complete;
        info!(
            "Shuffle {} complete ({} map outputs)",
            shuffle.0,
            state.outputs.len()
        );
        Ok(())
    }

    /// Read every block addressed to `reduce_index`, in map order.
    pub fn shuffle_read(&self, shuffle: ShuffleId, reduce_index: usize) -> Result<Vec<Value>, TaskError> {
        let aborted = || TaskError::new("shuffleRead", TaskErrorKind::ShuffleAborted(shuffle.0));

        let blocks: Vec<Arc<Vec<u8>>> = {
            let shuffles = self.lock_shuffles();
            let state = shuffles.get(&shuffle).ok_or_else(aborted)?;
            if state.status != ShuffleStatus::Complete || reduce_index >= state.num_reduces {
                return Err(aborted());
            }
            state
                .outputs
                .iter()
                .flatten()
                .filter_map(|output| output.blocks.get(&reduce_index).cloned())
                .collect()
        };

        let mut records = Vec::with_capacity(self.block_size_hint / 32);
        for block in blocks {
            let decoded: Vec<Value> = self
                .codec
                .decode(&block)
                .and_then(|bytes| serialization::decode(&bytes))
                .map_err(|e| TaskError::new("shuffleRead", TaskErrorKind::Storage(e.to_string())))?;
            records.extend(decoded);
        }
        Ok(records)
    }

    /// Discard all output of a shuffle. Later publishes and reads fail.
    pub fn abort(&self, shuffle: ShuffleId) {
        let mut shuffles = self.lock_shuffles();
        if let Some(state) = shuffles.get_mut(&shuffle) {
            if state.status != ShuffleStatus::Aborted {
                state.status = ShuffleStatus::Aborted;
                state.outputs.iter_mut().for_each(|o| *o = None);
                drop(shuffles);
                self.lock_stats().aborted += 1;
                warn!("Aborted shuffle {}", shuffle.0);
            }
        }
    }

    /// Forget a shuffle and free its blocks.
    pub fn unregister(&self, shuffle: ShuffleId) {
        if self.lock_shuffles().remove(&shuffle).is_some() {
            debug!("Unregistered shuffle {}", shuffle.0);
        }
    }

    /// Drop every shuffle.
    pub fn clear(&self) {
        self.lock_shuffles().clear();
    }

    pub fn stats(&self) -> ShuffleStats {
        let mut stats = self.lock_stats().clone();
        stats.active = self.lock_shuffles().len();
        stats
    }
}

/// Bucket `(key, value)` records by the partitioner applied to the key.
pub fn bucket_by_key(
    records: Vec<Value>,
    partitioner: &dyn Partitioner,
    node_kind: &str,
) -> Result<Vec<Vec<Value>>, TaskError> {
    let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); partitioner.num_partitions()];
    for record in records {
        let target = match record.key() {
            Some(key) => partitioner.partition(key),
            None => {
                return Err(TaskError::new(
                    node_kind,
                    TaskErrorKind::NotAPair(record.to_string()),
                ));
            }
        };
        buckets[target].push(record);
    }
    Ok(buckets)
}

/// Deal records round-robin, starting at an offset derived from the source.
pub fn bucket_round_robin(records: Vec<Value>, num_partitions: usize, source_index: usize) -> Vec<Vec<Value>> {
    let mut partitioner = RoundRobinPartitioner::for_source(num_partitions, source_index);
    let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); num_partitions.max(1)];
    for record in records {
        buckets[partitioner.next_partition()].push(record);
    }
    buckets
}

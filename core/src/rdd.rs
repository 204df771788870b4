//! Dataset handle.
//!
//! An [`Rdd`] names one node of the lineage graph. Transformations add a
//! node and return a new handle without computing anything; actions hand
//! the node to the scheduler.

use std::fmt;
use std::sync::Arc;

use ember_common::CommonError;
use tokio_util::sync::CancellationToken;

use crate::cache::StorageLevel;
use crate::context::EmberContext;
use crate::error::{EngineError, EngineResult};
use crate::lineage::{CombineOp, NodeId, NodeKind};
use crate::scheduler::{ActionKind, ActionResult};
use crate::shuffle::{Aggregator, CombineAggregator, GroupByKeyAggregator, ReduceAggregator};
use crate::value::Value;

/// A lazily evaluated, partitioned collection of [`Value`]s.
#[derive(Clone)]
pub struct Rdd {
    ctx: Arc<EmberContext>,
    id: NodeId,
    num_partitions: usize,
}

impl fmt::Debug for Rdd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rdd")
            .field("id", &self.id)
            .field("num_partitions", &self.num_partitions)
            .finish()
    }
}

impl Rdd {
    pub(crate) fn new(ctx: Arc<EmberContext>, id: NodeId, num_partitions: usize) -> Self {
        Self {
            ctx,
            id,
            num_partitions,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn context(&self) -> &Arc<EmberContext> {
        &self.ctx
    }

    fn derive(&self, kind: NodeKind, num_partitions: usize) -> Rdd {
        let id = self.ctx.graph().append(kind, vec![self.id], num_partitions);
        Rdd::new(self.ctx.clone(), id, num_partitions)
    }

    fn combine(&self, aggregator: Arc<dyn Aggregator>, op: CombineOp, num_partitions: usize) -> Rdd {
        self.derive(NodeKind::CombineByKey { aggregator, op }, num_partitions.max(1))
    }

    // --- Narrow transformations ---

    pub fn map<F>(&self, f: F) -> Rdd
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.derive(NodeKind::Map(Arc::new(f)), self.num_partitions)
    }

    pub fn filter<F>(&self, f: F) -> Rdd
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.derive(NodeKind::Filter(Arc::new(f)), self.num_partitions)
    }

    /// Map each record to zero or more records.
    pub fn flat_map<F, I>(&self, f: F) -> Rdd
    where
        F: Fn(Value) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Value>,
    {
        let f = Arc::new(move |v: Value| f(v).into_iter().collect::<Vec<Value>>());
        self.derive(NodeKind::FlatMap(f), self.num_partitions)
    }

    /// One [`Value::List`] per partition holding the partition's records.
    pub fn glom(&self) -> Rdd {
        self.derive(NodeKind::Glom, self.num_partitions)
    }

    /// Apply `f` to the value of every `(key, value)` pair.
    pub fn map_values<F>(&self, f: F) -> Rdd
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.derive(NodeKind::MapValues(Arc::new(f)), self.num_partitions)
    }

    pub fn keys(&self) -> Rdd {
        self.derive(NodeKind::Keys, self.num_partitions)
    }

    pub fn values(&self) -> Rdd {
        self.derive(NodeKind::Values, self.num_partitions)
    }

    /// Merge partitions without a shuffle. Output partition `i` holds a
    /// contiguous run of input partitions, so record order is preserved.
    pub fn coalesce(&self, num_partitions: usize) -> EngineResult<Rdd> {
        if num_partitions == 0 {
            return Err(EngineError::InvalidArgument(
                "coalesce needs at least one partition".to_string(),
            ));
        }
        let current = self.num_partitions;
        if num_partitions > current {
            return Err(EngineError::InvalidCoalesce {
                current,
                requested: num_partitions,
            });
        }
        let groups = (0..num_partitions)
            .map(|i| (i * current / num_partitions..(i + 1) * current / num_partitions).collect())
            .collect();
        Ok(self.derive(NodeKind::Coalesce { groups }, num_partitions))
    }

    // --- Wide transformations ---

    /// Merge the values of each key with an associative function.
    pub fn reduce_by_key<F>(&self, f: F) -> Rdd
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        self.reduce_by_key_with_partitions(f, self.num_partitions)
    }

    pub fn reduce_by_key_with_partitions<F>(&self, f: F, num_partitions: usize) -> Rdd
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        let aggregator = Arc::new(ReduceAggregator::new(Arc::new(f)));
        self.combine(aggregator, CombineOp::ReduceByKey, num_partitions)
    }

    /// Collect the values of each key into a [`Value::List`].
    pub fn group_by_key(&self) -> Rdd {
        self.combine(
            Arc::new(GroupByKeyAggregator),
            CombineOp::GroupByKey,
            self.num_partitions,
        )
    }

    pub fn combine_by_key<C, MV, MC>(&self, create_combiner: C, merge_value: MV, merge_combiners: MC) -> Rdd
    where
        C: Fn(Value) -> Value + Send + Sync + 'static,
        MV: Fn(Value, Value) -> Value + Send + Sync + 'static,
        MC: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        let aggregator = Arc::new(CombineAggregator::new(
            Arc::new(create_combiner),
            Arc::new(merge_value),
            Arc::new(merge_combiners),
        ));
        self.combine(aggregator, CombineOp::CombineByKey, self.num_partitions)
    }

    /// Distinct records, in no particular order.
    pub fn distinct(&self) -> Rdd {
        self.map(|v| Value::pair(v, Value::Null))
            .reduce_by_key(|first, _| first)
            .keys()
    }

    /// Sort `(key, value)` pairs by key. Partition `i` holds keys that
    /// order before those of partition `i + 1`.
    pub fn sort_by_key(&self, ascending: bool) -> Rdd {
        self.sort_by_key_with_partitions(ascending, self.num_partitions)
    }

    pub fn sort_by_key_with_partitions(&self, ascending: bool, num_partitions: usize) -> Rdd {
        self.derive(NodeKind::SortByKey { ascending }, num_partitions.max(1))
    }

    /// Shuffle into exactly `num_partitions` evenly sized partitions.
    pub fn repartition(&self, num_partitions: usize) -> EngineResult<Rdd> {
        if num_partitions == 0 {
            return Err(EngineError::InvalidArgument(
                "repartition needs at least one partition".to_string(),
            ));
        }
        Ok(self.derive(NodeKind::Repartition, num_partitions))
    }

    // --- Persistence ---

    /// Persist at [`StorageLevel::MemoryOnly`].
    pub fn cache(&self) -> EngineResult<Rdd> {
        self.persist(StorageLevel::MemoryOnly)
    }

    /// Mark the dataset for caching. Partitions are stored the first time
    /// an action computes them.
    pub fn persist(&self, level: StorageLevel) -> EngineResult<Rdd> {
        self.ctx.cache().mark_for_cache(self.id, level)?;
        Ok(self.clone())
    }

    pub async fn unpersist(&self) -> EngineResult<()> {
        self.ctx.cache().unpersist(self.id).await
    }

    pub fn storage_level(&self) -> StorageLevel {
        self.ctx.cache().storage_level(self.id)
    }

    /// Operation names from this dataset back to its sources.
    pub fn lineage(&self) -> EngineResult<Vec<String>> {
        let mut nodes = self.ctx.graph().resolve(self.id)?;
        nodes.reverse();
        Ok(nodes
            .iter()
            .map(|node| node.kind.name().to_string())
            .collect())
    }

    pub fn to_debug_string(&self) -> EngineResult<String> {
        self.ctx.graph().debug_string(self.id)
    }

    // --- Actions ---

    async fn run(&self, action: ActionKind, cancel: Option<&CancellationToken>) -> EngineResult<ActionResult> {
        self.ctx.run_action(self.id, action, cancel).await
    }

    async fn run_for_records(
        &self,
        action: ActionKind,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<Vec<Value>> {
        match self.run(action, cancel).await? {
            ActionResult::Records(records) => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    /// Every record, partitions in index order.
    pub async fn collect(&self) -> EngineResult<Vec<Value>> {
        self.run_for_records(ActionKind::Collect, None).await
    }

    pub async fn collect_with_cancel(&self, cancel: &CancellationToken) -> EngineResult<Vec<Value>> {
        self.run_for_records(ActionKind::Collect, Some(cancel)).await
    }

    /// The first `n` records, scanning partitions in index order.
    pub async fn take(&self, n: usize) -> EngineResult<Vec<Value>> {
        self.run_for_records(ActionKind::Take(n), None).await
    }

    pub async fn take_with_cancel(&self, n: usize, cancel: &CancellationToken) -> EngineResult<Vec<Value>> {
        self.run_for_records(ActionKind::Take(n), Some(cancel)).await
    }

    pub async fn first(&self) -> EngineResult<Option<Value>> {
        Ok(self.take(1).await?.into_iter().next())
    }

    pub async fn count(&self) -> EngineResult<usize> {
        self.count_inner(None).await
    }

    pub async fn count_with_cancel(&self, cancel: &CancellationToken) -> EngineResult<usize> {
        self.count_inner(Some(cancel)).await
    }

    async fn count_inner(&self, cancel: Option<&CancellationToken>) -> EngineResult<usize> {
        match self.run(ActionKind::Count, cancel).await? {
            ActionResult::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Run `f` on every record, on the workers.
    pub async fn foreach<F>(&self, f: F) -> EngineResult<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.run(ActionKind::Foreach(Arc::new(f)), None).await?;
        Ok(())
    }

    pub async fn foreach_with_cancel<F>(&self, f: F, cancel: &CancellationToken) -> EngineResult<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.run(ActionKind::Foreach(Arc::new(f)), Some(cancel)).await?;
        Ok(())
    }

    /// Write one `part-NNNNN` object per partition under `uri`, then a
    /// `_SUCCESS` marker. Fails if anything already exists under `uri`.
    pub async fn save_as_text_file(&self, uri: &str) -> EngineResult<()> {
        self.run(ActionKind::SaveAsText(uri.to_string()), None).await?;
        Ok(())
    }

    pub async fn save_as_text_file_with_cancel(&self, uri: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.run(ActionKind::SaveAsText(uri.to_string()), Some(cancel))
            .await?;
        Ok(())
    }
}

fn unexpected(result: ActionResult) -> EngineError {
    EngineError::Common(CommonError::internal_error(format!(
        "unexpected action result {:?}",
        result
    )))
}

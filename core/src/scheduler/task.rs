//! Task evaluation.
//!
//! A task computes one partition of a stage's node by walking the node's
//! narrow lineage. The walk stops at sources, at partitions materialized
//! earlier in the job (cached datasets) and at shuffle nodes, whose input
//! is read from the shuffle engine.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, TaskErrorKind, panic_message};
use crate::lineage::{Node, NodeId, NodeKind};
use crate::shuffle::{
    HashPartitioner, MapOutput, RangePartitioner, ShuffleEngine, ShuffleId, bucket_by_key,
    bucket_round_robin, combine_combiners_by_key, combine_values_by_key,
};
use crate::value::Value;

pub type ForeachFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// What a finished task hands back to the scheduler.
#[derive(Debug)]
pub enum TaskOutput {
    Records(Vec<Value>),
    Shuffle(MapOutput),
    Sample(Vec<Value>),
    Count(usize),
    Text(String),
    Done,
}

/// Everything a task may read. Built once per stage and shared by its tasks.
pub struct TaskContext {
    pub(crate) nodes: Arc<HashMap<NodeId, Arc<Node>>>,
    pub(crate) sources: HashMap<NodeId, Arc<Vec<Vec<Value>>>>,
    pub(crate) materialized: HashMap<NodeId, HashMap<usize, Arc<Vec<Value>>>>,
    pub(crate) shuffles: HashMap<NodeId, ShuffleId>,
    pub(crate) range_partitioners: HashMap<NodeId, Arc<RangePartitioner>>,
    pub(crate) shuffle_engine: Arc<ShuffleEngine>,
    pub(crate) cancel: CancellationToken,
}

/// Run a user function, turning a panic into a task error.
fn guarded<T>(node_kind: &str, f: impl FnOnce() -> T) -> Result<T, TaskError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        TaskError::new(
            node_kind,
            TaskErrorKind::UserFunction(panic_message(payload.as_ref())),
        )
    })
}

fn expect_pair(record: Value, node_kind: &str) -> Result<(Value, Value), TaskError> {
    match record {
        Value::Pair(k, v) => Ok((*k, *v)),
        other => Err(TaskError::new(
            node_kind,
            TaskErrorKind::NotAPair(other.to_string()),
        )),
    }
}

fn into_pairs(records: Vec<Value>, node_kind: &str) -> Result<Vec<(Value, Value)>, TaskError> {
    records
        .into_iter()
        .map(|r| expect_pair(r, node_kind))
        .collect()
}

fn from_pairs(pairs: Vec<(Value, Value)>) -> Vec<Value> {
    pairs.into_iter().map(|(k, v)| Value::pair(k, v)).collect()
}

impl TaskContext {
    fn node(&self, id: NodeId) -> Result<&Arc<Node>, TaskError> {
        self.nodes.get(&id).ok_or_else(|| {
            TaskError::new("task", TaskErrorKind::Internal(format!("unknown node {}", id)))
        })
    }

    fn parent_of(&self, node: &Node) -> Result<NodeId, TaskError> {
        node.parent().ok_or_else(|| {
            TaskError::new(
                node.kind.name(),
                TaskErrorKind::Internal(format!("node {} has no parent", node.id)),
            )
        })
    }

    fn shuffle_for(&self, node: &Node) -> Result<ShuffleId, TaskError> {
        self.shuffles.get(&node.id).copied().ok_or_else(|| {
            TaskError::new(
                node.kind.name(),
                TaskErrorKind::Internal(format!("no shuffle registered for node {}", node.id)),
            )
        })
    }

    /// Compute one partition of `id`.
    pub fn compute(&self, id: NodeId, partition: usize) -> Result<Vec<Value>, TaskError> {
        let node = self.node(id)?;
        let kind = node.kind.name();
        if self.cancel.is_cancelled() {
            return Err(TaskError::cancelled(kind));
        }

        if let Some(data) = self.materialized.get(&id).and_then(|m| m.get(&partition)) {
            return Ok(data.as_ref().clone());
        }

        match &node.kind {
            NodeKind::Parallelize { slices } => Ok(slices.get(partition).cloned().unwrap_or_default()),
            NodeKind::TextFile { .. } => Ok(self
                .sources
                .get(&id)
                .and_then(|parts| parts.get(partition))
                .cloned()
                .unwrap_or_default()),
            NodeKind::Map(f) => {
                let input = self.compute(self.parent_of(node)?, partition)?;
                guarded(kind, || input.into_iter().map(|v| f(v)).collect())
            }
            NodeKind::Filter(f) => {
                let mut input = self.compute(self.parent_of(node)?, partition)?;
                guarded(kind, || {
                    input.retain(|v| f(v));
                    input
                })
            }
            NodeKind::FlatMap(f) => {
                let input = self.compute(self.parent_of(node)?, partition)?;
                guarded(kind, || input.into_iter().flat_map(|v| f(v)).collect())
            }
            NodeKind::MapValues(f) => {
                let pairs = into_pairs(self.compute(self.parent_of(node)?, partition)?, kind)?;
                guarded(kind, || {
                    pairs
                        .into_iter()
                        .map(|(k, v)| Value::pair(k, f(v)))
                        .collect()
                })
            }
            NodeKind::Keys => {
                let pairs = into_pairs(self.compute(self.parent_of(node)?, partition)?, kind)?;
                Ok(pairs.into_iter().map(|(k, _)| k).collect())
            }
            NodeKind::Values => {
                let pairs = into_pairs(self.compute(self.parent_of(node)?, partition)?, kind)?;
                Ok(pairs.into_iter().map(|(_, v)| v).collect())
            }
            NodeKind::Glom => {
                let input = self.compute(self.parent_of(node)?, partition)?;
                Ok(vec![Value::List(input)])
            }
            NodeKind::Coalesce { groups } => {
                let parent = self.parent_of(node)?;
                let mut output = Vec::new();
                for source in groups.get(partition).into_iter().flatten() {
                    output.extend(self.compute(parent, *source)?);
                }
                Ok(output)
            }
            NodeKind::CombineByKey { aggregator, .. } => {
                let records = self.read_shuffle(node, partition)?;
                let partials = into_pairs(records, kind)?;
                let merged = guarded(kind, || combine_combiners_by_key(aggregator.as_ref(), partials))?;
                Ok(from_pairs(merged))
            }
            NodeKind::SortByKey { ascending } => {
                let mut records = self.read_shuffle(node, partition)?;
                // pairs order by key, then value
                records.sort_unstable();
                if !ascending {
                    records.reverse();
                }
                Ok(records)
            }
            NodeKind::Repartition => self.read_shuffle(node, partition),
        }
    }

    fn read_shuffle(&self, node: &Node, partition: usize) -> Result<Vec<Value>, TaskError> {
        let shuffle = self.shuffle_for(node)?;
        self.shuffle_engine
            .shuffle_read(shuffle, partition)
            .map_err(|e| TaskError::new(node.kind.name(), e.kind))
    }

    /// Map side of the shuffle feeding `shuffle_node`: compute one partition
    /// of its parent, then bucket and encode it.
    pub fn shuffle_map(&self, shuffle_node: NodeId, partition: usize) -> Result<MapOutput, TaskError> {
        let node = self.node(shuffle_node)?;
        let kind = node.kind.name();
        let records = self.compute(self.parent_of(node)?, partition)?;

        let buckets = match &node.kind {
            NodeKind::CombineByKey { aggregator, .. } => {
                let pairs = into_pairs(records, kind)?;
                let combined = guarded(kind, || combine_values_by_key(aggregator.as_ref(), pairs))?;
                let partitioner = HashPartitioner::new(node.num_partitions);
                bucket_by_key(from_pairs(combined), &partitioner, kind)?
            }
            NodeKind::SortByKey { .. } => {
                let partitioner = self.range_partitioners.get(&node.id).ok_or_else(|| {
                    TaskError::new(kind, TaskErrorKind::Internal("missing range bounds".into()))
                })?;
                bucket_by_key(records, partitioner.as_ref(), kind)?
            }
            NodeKind::Repartition => bucket_round_robin(records, node.num_partitions, partition),
            _ => {
                return Err(TaskError::new(
                    kind,
                    TaskErrorKind::Internal(format!("{} is not a shuffle node", kind)),
                ));
            }
        };

        if self.cancel.is_cancelled() {
            return Err(TaskError::cancelled(kind));
        }
        self.shuffle_engine
            .shuffle_write(buckets)
            .map_err(|e| TaskError::new(kind, e.kind))
    }

    /// Up to `count` keys spread evenly over one partition of `node`.
    pub fn sample_keys(&self, node: NodeId, partition: usize, count: usize) -> Result<Vec<Value>, TaskError> {
        let kind = self.node(node)?.kind.name();
        let keys: Vec<Value> = into_pairs(self.compute(node, partition)?, kind)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        if keys.len() <= count {
            return Ok(keys);
        }
        let step = keys.len() as f64 / count as f64;
        Ok((0..count)
            .map(|i| keys[((i as f64 * step) as usize).min(keys.len() - 1)].clone())
            .collect())
    }

    /// Apply a side effect to every record of a partition.
    pub fn foreach(&self, id: NodeId, partition: usize, f: &ForeachFn) -> Result<(), TaskError> {
        let records = self.compute(id, partition)?;
        guarded("foreach", || records.iter().for_each(|r| f(r)))
    }

    /// Render a partition as text, one record per line.
    pub fn render_text(&self, id: NodeId, partition: usize) -> Result<String, TaskError> {
        let records = self.compute(id, partition)?;
        Ok(crate::io::render_lines(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::{CombineOp, LineageGraph};
    use crate::shuffle::{Partitioner, ReduceAggregator};
    use ember_common::CompressionAlgorithm;

    fn context(graph: &LineageGraph, target: NodeId) -> TaskContext {
        let nodes = graph
            .resolve(target)
            .unwrap()
            .into_iter()
            .map(|n| (n.id, n))
            .collect();
        TaskContext {
            nodes: Arc::new(nodes),
            sources: HashMap::new(),
            materialized: HashMap::new(),
            shuffles: HashMap::new(),
            range_partitioners: HashMap::new(),
            shuffle_engine: Arc::new(ShuffleEngine::new(CompressionAlgorithm::None, 1024)),
            cancel: CancellationToken::new(),
        }
    }

    fn words_source(graph: &LineageGraph) -> NodeId {
        let line = "test1 test2 test3 test2 test4 test5 test6 test2 test7";
        let slices = Arc::new(vec![vec![Value::from(line)]]);
        graph
            .add_node(NodeKind::Parallelize { slices }, vec![], 1)
            .unwrap()
    }

    #[test]
    fn test_narrow_pipeline() {
        let graph = LineageGraph::new();
        let src = words_source(&graph);
        let words = graph
            .add_node(
                NodeKind::FlatMap(Arc::new(|line: Value| {
                    line.as_str()
                        .unwrap_or_default()
                        .split(' ')
                        .map(Value::from)
                        .collect()
                })),
                vec![src],
                1,
            )
            .unwrap();
        let kept = graph
            .add_node(
                NodeKind::Filter(Arc::new(|w: &Value| {
                    !w.as_str().unwrap_or_default().ends_with('1')
                })),
                vec![words],
                1,
            )
            .unwrap();

        let ctx = context(&graph, kept);
        let out = ctx.compute(kept, 0).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], Value::from("test2"));
    }

    #[test]
    fn test_user_panic_is_reported_with_node_kind() {
        let graph = LineageGraph::new();
        let src = words_source(&graph);
        let bad = graph
            .add_node(
                NodeKind::Map(Arc::new(|_: Value| -> Value { panic!("bad record") })),
                vec![src],
                1,
            )
            .unwrap();
        let err = context(&graph, bad).compute(bad, 0).unwrap_err();
        assert_eq!(err.node_kind, "map");
        assert_eq!(err.kind, TaskErrorKind::UserFunction("bad record".into()));
    }

    #[test]
    fn test_keys_require_pairs() {
        let graph = LineageGraph::new();
        let src = words_source(&graph);
        let keys = graph.add_node(NodeKind::Keys, vec![src], 1).unwrap();
        let err = context(&graph, keys).compute(keys, 0).unwrap_err();
        assert!(matches!(err.kind, TaskErrorKind::NotAPair(_)));
    }

    #[test]
    fn test_cancelled_context_stops_work() {
        let graph = LineageGraph::new();
        let src = words_source(&graph);
        let ctx = context(&graph, src);
        ctx.cancel.cancel();
        assert_eq!(ctx.compute(src, 0).unwrap_err().kind, TaskErrorKind::Cancelled);
    }

    #[test]
    fn test_shuffle_map_then_reduce() {
        let graph = LineageGraph::new();
        let slices = Arc::new(vec![
            vec![Value::pair("a", 1), Value::pair("b", 1), Value::pair("a", 1)],
            vec![Value::pair("a", 1)],
        ]);
        let src = graph
            .add_node(NodeKind::Parallelize { slices }, vec![], 2)
            .unwrap();
        let aggregator = Arc::new(ReduceAggregator::new(Arc::new(|a: Value, b: Value| {
            Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
        })));
        let reduced = graph
            .add_node(
                NodeKind::CombineByKey {
                    aggregator,
                    op: CombineOp::ReduceByKey,
                },
                vec![src],
                1,
            )
            .unwrap();

        let mut ctx = context(&graph, reduced);
        let shuffle = ctx.shuffle_engine.register(2, 1);
        ctx.shuffles.insert(reduced, shuffle);
        for p in 0..2 {
            let output = ctx.shuffle_map(reduced, p).unwrap();
            ctx.shuffle_engine.publish(shuffle, p, output).unwrap();
        }
        ctx.shuffle_engine.mark_complete(shuffle).unwrap();

        let mut out = ctx.compute(reduced, 0).unwrap();
        out.sort();
        assert_eq!(out, vec![Value::pair("a", 3), Value::pair("b", 1)]);
    }

    #[test]
    fn test_sample_keys_is_bounded() {
        let graph = LineageGraph::new();
        let slices = Arc::new(vec![(0..100).map(|i: i64| Value::pair(i, i)).collect()]);
        let src = graph
            .add_node(NodeKind::Parallelize { slices }, vec![], 1)
            .unwrap();
        let ctx = context(&graph, src);
        let sample = ctx.sample_keys(src, 0, 10).unwrap();
        assert_eq!(sample.len(), 10);
        assert_eq!(sample[0], Value::from(0));

        let partitioner = RangePartitioner::from_sample(4, sample, true);
        assert_eq!(partitioner.num_partitions(), 4);
    }
}

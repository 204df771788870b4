//! Job scheduler.
//!
//! Turns an action on a dataset into stages, runs each stage's tasks on the
//! worker pool and assembles the action's result. Stages run one at a time
//! in index order; a stage starts only after every task of the stages it
//! depends on has succeeded.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember_common::{CommonError, Storage};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stage::{Stage, StageKind, StagePlanner};
use super::task::{ForeachFn, TaskContext, TaskOutput};
use super::worker_pool::WorkerPool;
use crate::cache::CacheManager;
use crate::error::{EngineError, EngineResult, TaskError, TaskErrorKind};
use crate::io;
use crate::lineage::{LineageGraph, Node, NodeId, NodeKind};
use crate::shuffle::{RangePartitioner, ShuffleEngine, ShuffleId};
use crate::value::Value;

/// What an action asks of its target dataset.
#[derive(Clone)]
pub enum ActionKind {
    Collect,
    Take(usize),
    Count,
    Foreach(ForeachFn),
    SaveAsText(String),
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Collect => "collect",
            ActionKind::Take(_) => "take",
            ActionKind::Count => "count",
            ActionKind::Foreach(_) => "foreach",
            ActionKind::SaveAsText(_) => "saveAsTextFile",
        }
    }
}

impl fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Take(n) => write!(f, "take({})", n),
            ActionKind::SaveAsText(path) => write!(f, "saveAsTextFile({})", path),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    Records(Vec<Value>),
    Count(usize),
    Unit,
}

/// Per-job state shared with the tasks of each stage.
#[derive(Default)]
struct JobState {
    sources: HashMap<NodeId, Arc<Vec<Vec<Value>>>>,
    materialized: HashMap<NodeId, HashMap<usize, Arc<Vec<Value>>>>,
    fully_cached: HashSet<NodeId>,
    shuffles: HashMap<NodeId, ShuffleId>,
    range_partitioners: HashMap<NodeId, Arc<RangePartitioner>>,
}

type TaskBody = Arc<dyn Fn(&TaskContext, usize) -> Result<TaskOutput, TaskError> + Send + Sync>;
type Attempt = BoxFuture<'static, (usize, u32, Result<TaskOutput, TaskError>)>;

/// Runs jobs against the lineage graph.
pub struct DagScheduler {
    graph: Arc<LineageGraph>,
    shuffle_engine: Arc<ShuffleEngine>,
    cache: Arc<CacheManager>,
    pool: Arc<dyn WorkerPool>,
    storage: Arc<dyn Storage>,
    task_max_retries: u32,
    sample_per_partition: usize,
    next_job_id: AtomicUsize,
}

impl fmt::Debug for DagScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DagScheduler")
            .field("workers", &self.pool.num_workers())
            .field("task_max_retries", &self.task_max_retries)
            .field("jobs", &self.next_job_id.load(Ordering::SeqCst))
            .finish()
    }
}

impl DagScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<LineageGraph>,
        shuffle_engine: Arc<ShuffleEngine>,
        cache: Arc<CacheManager>,
        pool: Arc<dyn WorkerPool>,
        storage: Arc<dyn Storage>,
        task_max_retries: u32,
        sample_per_partition: usize,
    ) -> Self {
        Self {
            graph,
            shuffle_engine,
            cache,
            pool,
            storage,
            task_max_retries,
            sample_per_partition: sample_per_partition.max(1),
            next_job_id: AtomicUsize::new(0),
        }
    }

    /// Run one action to completion.
    pub async fn run_action(
        &self,
        target: NodeId,
        action: ActionKind,
        cancel: &CancellationToken,
    ) -> EngineResult<ActionResult> {
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let nodes: Arc<HashMap<NodeId, Arc<Node>>> = Arc::new(
            self.graph
                .resolve(target)?
                .into_iter()
                .map(|node| (node.id, node))
                .collect(),
        );

        let mut job = JobState::default();
        self.prefetch(&nodes, target, &mut job).await?;

        let marked: HashSet<NodeId> = self
            .cache
            .marked()
            .into_iter()
            .map(|(node, _)| node)
            .filter(|node| nodes.contains_key(node))
            .collect();
        let stages = StagePlanner::new(&nodes, &marked, &job.fully_cached).plan(target)?;
        info!(
            "Job {} started: {:?} on dataset {} ({} stages)",
            job_id,
            action,
            target,
            stages.len()
        );

        let result = self.run_stages(&nodes, &stages, &action, &mut job, cancel).await;
        for shuffle in job.shuffles.values() {
            self.shuffle_engine.unregister(*shuffle);
        }

        match &result {
            Ok(_) => info!("Job {} finished", job_id),
            Err(e) if e.is_cancelled() => warn!("Job {} cancelled", job_id),
            Err(e) => error!("Job {} failed: {}", job_id, e),
        }
        result
    }

    /// Load cached partitions and text inputs reachable from `target`.
    ///
    /// The walk does not descend below a dataset whose every partition is
    /// cached, so nothing under it is read or recomputed.
    async fn prefetch(
        &self,
        nodes: &HashMap<NodeId, Arc<Node>>,
        target: NodeId,
        job: &mut JobState,
    ) -> EngineResult<()> {
        let mut seen = HashSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = nodes.get(&id).ok_or(EngineError::UnknownNode(id))?;

            if self.cache.is_marked(id) {
                let mut held = HashMap::new();
                for partition in 0..node.num_partitions {
                    if let Some(data) = self.cache.get_partition(id, partition).await? {
                        held.insert(partition, data);
                    }
                }
                let complete = held.len() == node.num_partitions;
                debug!(
                    "Dataset {} has {}/{} cached partitions",
                    id,
                    held.len(),
                    node.num_partitions
                );
                job.materialized.insert(id, held);
                if complete {
                    job.fully_cached.insert(id);
                    continue;
                }
            }

            if let NodeKind::TextFile { path } = &node.kind {
                let key = io::input_key(path);
                let bytes = self
                    .storage
                    .get(&key)
                    .await?
                    .ok_or_else(|| CommonError::not_found_error(format!("Input not found: {}", path)))?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    CommonError::deserialization_error_with_source(
                        format!("Input is not valid UTF-8: {}", path),
                        e,
                    )
                })?;
                job.sources
                    .insert(id, Arc::new(io::split_lines(&text, node.num_partitions)));
            }
            stack.extend(node.parents.iter().copied());
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        nodes: &Arc<HashMap<NodeId, Arc<Node>>>,
        stages: &[Stage],
        action: &ActionKind,
        job: &mut JobState,
        cancel: &CancellationToken,
    ) -> EngineResult<ActionResult> {
        for stage in stages {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            debug!(
                "Stage {} ({:?}) on dataset {} with {} partitions",
                stage.index, stage.kind, stage.node, stage.num_partitions
            );
            match stage.kind {
                StageKind::ShuffleMap { shuffle_node } => {
                    self.run_shuffle_map_stage(nodes, stage, shuffle_node, job, cancel)
                        .await?
                }
                StageKind::CacheMaterialize => {
                    self.run_cache_stage(nodes, stage, job, cancel).await?
                }
                StageKind::Result => {
                    return self.run_result_stage(nodes, stage, action, job, cancel).await;
                }
            }
        }
        Err(EngineError::Common(CommonError::internal_error(
            "job plan has no result stage",
        )))
    }

    fn task_context(
        &self,
        nodes: &Arc<HashMap<NodeId, Arc<Node>>>,
        job: &JobState,
        cancel: CancellationToken,
    ) -> Arc<TaskContext> {
        Arc::new(TaskContext {
            nodes: nodes.clone(),
            sources: job.sources.clone(),
            materialized: job.materialized.clone(),
            shuffles: job.shuffles.clone(),
            range_partitioners: job.range_partitioners.clone(),
            shuffle_engine: self.shuffle_engine.clone(),
            cancel,
        })
    }

    async fn run_shuffle_map_stage(
        &self,
        nodes: &Arc<HashMap<NodeId, Arc<Node>>>,
        stage: &Stage,
        shuffle_node: NodeId,
        job: &mut JobState,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let wide = nodes
            .get(&shuffle_node)
            .ok_or(EngineError::UnknownNode(shuffle_node))?;
        let partitions: Vec<usize> = (0..stage.num_partitions).collect();

        if let NodeKind::SortByKey { ascending } = wide.kind {
            let parent = stage.node;
            let per_partition = self.sample_per_partition;
            let ctx = self.task_context(nodes, job, cancel.child_token());
            let samples = self
                .run_tasks(
                    stage,
                    ctx,
                    partitions.clone(),
                    Arc::new(move |ctx: &TaskContext, p: usize| {
                        ctx.sample_keys(parent, p, per_partition)
                            .map(TaskOutput::Sample)
                    }),
                )
                .await?;
            let sample: Vec<Value> = samples
                .into_iter()
                .flat_map(|(_, output)| match output {
                    TaskOutput::Sample(keys) => keys,
                    _ => Vec::new(),
                })
                .collect();
            let partitioner = RangePartitioner::from_sample(wide.num_partitions, sample, ascending);
            debug!(
                "Range bounds for dataset {}: {:?}",
                shuffle_node,
                partitioner.bounds()
            );
            job.range_partitioners
                .insert(shuffle_node, Arc::new(partitioner));
        }

        let shuffle = self
            .shuffle_engine
            .register(stage.num_partitions, wide.num_partitions);
        job.shuffles.insert(shuffle_node, shuffle);

        let ctx = self.task_context(nodes, job, cancel.child_token());
        let outputs = self
            .run_tasks(
                stage,
                ctx,
                partitions,
                Arc::new(move |ctx: &TaskContext, p: usize| {
                    ctx.shuffle_map(shuffle_node, p).map(TaskOutput::Shuffle)
                }),
            )
            .await;

        let published = outputs.and_then(|outputs| {
            for (p, output) in outputs {
                if let TaskOutput::Shuffle(map_output) = output {
                    self.shuffle_engine.publish(shuffle, p, map_output)?;
                }
            }
            self.shuffle_engine.mark_complete(shuffle)
        });
        if published.is_err() {
            self.shuffle_engine.abort(shuffle);
        }
        published
    }

    async fn run_cache_stage(
        &self,
        nodes: &Arc<HashMap<NodeId, Arc<Node>>>,
        stage: &Stage,
        job: &mut JobState,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let node = stage.node;
        let held = job.materialized.get(&node);
        let missing: Vec<usize> = (0..stage.num_partitions)
            .filter(|p| held.is_none_or(|m| !m.contains_key(p)))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let ctx = self.task_context(nodes, job, cancel.child_token());
        let outputs = self
            .run_tasks(
                stage,
                ctx,
                missing,
                Arc::new(move |ctx: &TaskContext, p: usize| {
                    ctx.compute(node, p).map(TaskOutput::Records)
                }),
            )
            .await?;

        for (p, output) in outputs {
            if let TaskOutput::Records(records) = output {
                let data = Arc::new(records);
                self.cache.put_partition(node, p, data.clone()).await?;
                job.materialized.entry(node).or_default().insert(p, data);
            }
        }
        Ok(())
    }

    async fn run_result_stage(
        &self,
        nodes: &Arc<HashMap<NodeId, Arc<Node>>>,
        stage: &Stage,
        action: &ActionKind,
        job: &mut JobState,
        cancel: &CancellationToken,
    ) -> EngineResult<ActionResult> {
        let node = stage.node;
        let all: Vec<usize> = (0..stage.num_partitions).collect();
        let ctx = self.task_context(nodes, job, cancel.child_token());

        match action {
            ActionKind::Collect => {
                let outputs = self
                    .run_tasks(stage, ctx, all, Self::compute_body(node))
                    .await?;
                Ok(ActionResult::Records(concat_records(outputs)))
            }
            ActionKind::Take(n) => {
                let n = *n;
                let mut taken = Vec::new();
                let mut next = 0;
                let mut batch = 1;
                while taken.len() < n && next < stage.num_partitions {
                    let end = (next + batch).min(stage.num_partitions);
                    let outputs = self
                        .run_tasks(
                            stage,
                            ctx.clone(),
                            (next..end).collect(),
                            Self::compute_body(node),
                        )
                        .await?;
                    taken.extend(concat_records(outputs));
                    next = end;
                    batch *= 4;
                }
                taken.truncate(n);
                Ok(ActionResult::Records(taken))
            }
            ActionKind::Count => {
                let outputs = self
                    .run_tasks(
                        stage,
                        ctx,
                        all,
                        Arc::new(move |ctx: &TaskContext, p: usize| {
                            ctx.compute(node, p).map(|r| TaskOutput::Count(r.len()))
                        }),
                    )
                    .await?;
                let count = outputs
                    .iter()
                    .map(|(_, output)| match output {
                        TaskOutput::Count(c) => *c,
                        _ => 0,
                    })
                    .sum();
                Ok(ActionResult::Count(count))
            }
            ActionKind::Foreach(f) => {
                let f = f.clone();
                self.run_tasks(
                    stage,
                    ctx,
                    all,
                    Arc::new(move |ctx: &TaskContext, p: usize| {
                        ctx.foreach(node, p, &f).map(|_| TaskOutput::Done)
                    }),
                )
                .await?;
                Ok(ActionResult::Unit)
            }
            ActionKind::SaveAsText(dir) => {
                let existing = self.storage.list_prefix(&io::output_prefix(dir)).await?;
                if !existing.is_empty() {
                    return Err(EngineError::InvalidArgument(format!(
                        "Output directory {} already exists",
                        dir
                    )));
                }
                let outputs = self
                    .run_tasks(
                        stage,
                        ctx,
                        all,
                        Arc::new(move |ctx: &TaskContext, p: usize| {
                            ctx.render_text(node, p).map(TaskOutput::Text)
                        }),
                    )
                    .await?;
                for (p, output) in outputs {
                    if let TaskOutput::Text(text) = output {
                        self.storage.put(&io::part_key(dir, p), text.as_bytes()).await?;
                    }
                }
                self.storage.put(&io::success_key(dir), b"").await?;
                info!(
                    "Saved {} part files to {}",
                    stage.num_partitions,
                    dir
                );
                Ok(ActionResult::Unit)
            }
        }
    }

    fn compute_body(node: NodeId) -> TaskBody {
        Arc::new(move |ctx: &TaskContext, p: usize| ctx.compute(node, p).map(TaskOutput::Records))
    }

    fn submit(&self, ctx: &Arc<TaskContext>, body: &TaskBody, partition: usize, attempt: u32) -> Attempt {
        let ctx = ctx.clone();
        let body = body.clone();
        let task = self.pool.submit(Box::new(move || body(&ctx, partition)));
        async move { (partition, attempt, task.await) }.boxed()
    }

    /// Run one task per partition and wait for all of them.
    ///
    /// Retryable failures are resubmitted up to `task_max_retries` times.
    /// The first final failure cancels the remaining tasks of the stage.
    /// Outputs are returned sorted by partition.
    async fn run_tasks(
        &self,
        stage: &Stage,
        ctx: Arc<TaskContext>,
        partitions: Vec<usize>,
        body: TaskBody,
    ) -> EngineResult<Vec<(usize, TaskOutput)>> {
        let token = ctx.cancel.clone();
        let mut running: FuturesUnordered<Attempt> = partitions
            .iter()
            .map(|p| self.submit(&ctx, &body, *p, 0))
            .collect();
        let mut outputs = Vec::with_capacity(partitions.len());

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = running.next() => Some(next),
            };
            let Some(next) = event else {
                drain(&mut running).await;
                return Err(EngineError::Cancelled);
            };
            let Some((partition, attempt, result)) = next else {
                break;
            };

            match result {
                Ok(output) => outputs.push((partition, output)),
                Err(err) if err.kind == TaskErrorKind::Cancelled || token.is_cancelled() => {
                    token.cancel();
                    drain(&mut running).await;
                    return Err(EngineError::Cancelled);
                }
                Err(err) if err.is_retryable() && attempt < self.task_max_retries => {
                    warn!(
                        "Task {} of stage {} failed (attempt {}): {}; retrying",
                        partition,
                        stage.index,
                        attempt + 1,
                        err
                    );
                    running.push(self.submit(&ctx, &body, partition, attempt + 1));
                }
                Err(err) => {
                    error!(
                        "Task {} of stage {} failed after {} attempts: {}",
                        partition,
                        stage.index,
                        attempt + 1,
                        err
                    );
                    token.cancel();
                    drain(&mut running).await;
                    return Err(EngineError::StageFailed {
                        stage: stage.index,
                        node_kind: err.node_kind.clone(),
                        source: Box::new(EngineError::TaskExecution(err)),
                    });
                }
            }
        }

        outputs.sort_by_key(|(p, _)| *p);
        Ok(outputs)
    }
}

/// Wait for in-flight attempts so no task outlives its stage.
async fn drain(running: &mut FuturesUnordered<Attempt>) {
    while running.next().await.is_some() {}
}

fn concat_records(outputs: Vec<(usize, TaskOutput)>) -> Vec<Value> {
    outputs
        .into_iter()
        .flat_map(|(_, output)| match output {
            TaskOutput::Records(records) => records,
            _ => Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PartitionStore, StorageLevel};
    use crate::lineage::CombineOp;
    use crate::scheduler::RayonWorkerPool;
    use crate::shuffle::ReduceAggregator;
    use ember_common::{BlockCodec, CompressionAlgorithm, StorageBuilder};
    use std::sync::atomic::AtomicU32;
    use tracing_test::traced_test;

    struct Harness {
        graph: Arc<LineageGraph>,
        cache: Arc<CacheManager>,
        shuffle_engine: Arc<ShuffleEngine>,
        scheduler: DagScheduler,
        storage: Arc<dyn Storage>,
    }

    async fn harness(retries: u32) -> Harness {
        let graph = Arc::new(LineageGraph::new());
        let storage = StorageBuilder::new().build().await.unwrap();
        let spill = StorageBuilder::new().build().await.unwrap();
        let store = Arc::new(PartitionStore::new(
            spill,
            BlockCodec::new(CompressionAlgorithm::None, 0),
            1 << 20,
            None,
        ));
        let cache = Arc::new(CacheManager::new(store));
        let shuffle_engine = Arc::new(ShuffleEngine::new(CompressionAlgorithm::Lz4, 1024));
        let pool: Arc<dyn WorkerPool> = Arc::new(RayonWorkerPool::new(2).unwrap());
        let scheduler = DagScheduler::new(
            graph.clone(),
            shuffle_engine.clone(),
            cache.clone(),
            pool,
            storage.clone(),
            retries,
            10,
        );
        Harness {
            graph,
            cache,
            shuffle_engine,
            scheduler,
            storage,
        }
    }

    fn ints(graph: &LineageGraph, values: Vec<Vec<i64>>) -> NodeId {
        let n = values.len();
        let slices = values
            .into_iter()
            .map(|slice| slice.into_iter().map(Value::from).collect())
            .collect();
        graph
            .add_node(
                NodeKind::Parallelize {
                    slices: Arc::new(slices),
                },
                vec![],
                n,
            )
            .unwrap()
    }

    async fn run(h: &Harness, node: NodeId, action: ActionKind) -> EngineResult<ActionResult> {
        h.scheduler
            .run_action(node, action, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_collect_preserves_partition_order() {
        let h = harness(0).await;
        let src = ints(&h.graph, vec![vec![1, 2], vec![3], vec![4, 5]]);
        let doubled = h
            .graph
            .add_node(
                NodeKind::Map(Arc::new(|v: Value| Value::Int(v.as_int().unwrap_or(0) * 2))),
                vec![src],
                3,
            )
            .unwrap();
        let result = run(&h, doubled, ActionKind::Collect).await.unwrap();
        let expected: Vec<Value> = [2, 4, 6, 8, 10].into_iter().map(Value::from).collect();
        assert_eq!(result, ActionResult::Records(expected));
    }

    #[tokio::test]
    async fn test_take_and_count() {
        let h = harness(0).await;
        let src = ints(&h.graph, vec![vec![1, 2], vec![], vec![3], vec![4, 5, 6]]);
        assert_eq!(
            run(&h, src, ActionKind::Take(4)).await.unwrap(),
            ActionResult::Records((1..=4).map(|i: i64| Value::from(i)).collect())
        );
        assert_eq!(
            run(&h, src, ActionKind::Take(0)).await.unwrap(),
            ActionResult::Records(vec![])
        );
        assert_eq!(
            run(&h, src, ActionKind::Count).await.unwrap(),
            ActionResult::Count(6)
        );
    }

    #[tokio::test]
    async fn test_shuffles_are_released_after_the_job() {
        let h = harness(0).await;
        let slices = vec![
            vec![Value::pair("a", 1), Value::pair("b", 2)],
            vec![Value::pair("a", 3)],
        ];
        let src = h
            .graph
            .add_node(
                NodeKind::Parallelize {
                    slices: Arc::new(slices),
                },
                vec![],
                2,
            )
            .unwrap();
        let aggregator = Arc::new(ReduceAggregator::new(Arc::new(|a: Value, b: Value| {
            Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
        })));
        let reduced = h
            .graph
            .add_node(
                NodeKind::CombineByKey {
                    aggregator,
                    op: CombineOp::ReduceByKey,
                },
                vec![src],
                2,
            )
            .unwrap();

        let ActionResult::Records(mut records) = run(&h, reduced, ActionKind::Collect).await.unwrap()
        else {
            panic!("expected records");
        };
        records.sort();
        assert_eq!(records, vec![Value::pair("a", 4), Value::pair("b", 2)]);

        let stats = h.shuffle_engine.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_flaky_task_is_retried() {
        let h = harness(3).await;
        let src = ints(&h.graph, vec![vec![1], vec![2]]);
        let failures = Arc::new(AtomicU32::new(0));
        let counter = failures.clone();
        let flaky = h
            .graph
            .add_node(
                NodeKind::Map(Arc::new(move |v: Value| {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        panic!("transient");
                    }
                    v
                })),
                vec![src],
                2,
            )
            .unwrap();
        let result = run(&h, flaky, ActionKind::Count).await.unwrap();
        assert_eq!(result, ActionResult::Count(2));
        assert!(failures.load(Ordering::SeqCst) >= 4);
        assert!(logs_contain("retrying"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_stage() {
        let h = harness(1).await;
        let src = ints(&h.graph, vec![vec![1], vec![2]]);
        let broken = h
            .graph
            .add_node(
                NodeKind::Filter(Arc::new(|_: &Value| -> bool { panic!("always") })),
                vec![src],
                2,
            )
            .unwrap();
        let err = run(&h, broken, ActionKind::Collect).await.unwrap_err();
        assert_eq!(err.stage(), Some(0));
        assert_eq!(err.node_kind(), Some("filter"));
        assert!(matches!(
            err.root_cause(),
            EngineError::TaskExecution(TaskError {
                kind: TaskErrorKind::UserFunction(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cached_partitions_are_reused() {
        let h = harness(0).await;
        let src = ints(&h.graph, vec![vec![1, 2], vec![3]]);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mapped = h
            .graph
            .add_node(
                NodeKind::Map(Arc::new(move |v: Value| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    v
                })),
                vec![src],
                2,
            )
            .unwrap();
        h.cache
            .mark_for_cache(mapped, StorageLevel::MemoryOnly)
            .unwrap();

        run(&h, mapped, ActionKind::Count).await.unwrap();
        run(&h, mapped, ActionKind::Collect).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(h.cache.is_materialized(mapped, 1).await);
    }

    #[tokio::test]
    async fn test_cancelled_job() {
        let h = harness(0).await;
        let src = ints(&h.graph, vec![vec![1]]);
        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .scheduler
            .run_action(src, ActionKind::Collect, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_save_as_text_refuses_existing_output() {
        let h = harness(0).await;
        let src = ints(&h.graph, vec![vec![1, 2], vec![3]]);
        run(&h, src, ActionKind::SaveAsText("out".into()))
            .await
            .unwrap();

        let keys = h.storage.list_prefix("out/").await.unwrap();
        assert_eq!(keys, vec!["out/_SUCCESS", "out/part-00000", "out/part-00001"]);
        let part = h.storage.get("out/part-00000").await.unwrap().unwrap();
        assert_eq!(part, b"1\n2\n");

        let err = run(&h, src, ActionKind::SaveAsText("out".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_missing_text_input() {
        let h = harness(0).await;
        let input = h
            .graph
            .add_node(
                NodeKind::TextFile {
                    path: "missing.txt".into(),
                },
                vec![],
                2,
            )
            .unwrap();
        let err = run(&h, input, ActionKind::Count).await.unwrap_err();
        assert!(matches!(err, EngineError::Common(_)));
    }
}

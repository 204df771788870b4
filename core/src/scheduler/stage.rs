//! Stage planning.
//!
//! A job is cut into stages at every shuffle and at every dataset marked
//! for caching. Stages are numbered so that a stage's dependencies always
//! have smaller indices; the last stage produces the action's result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::lineage::{Node, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Computes the parent of `shuffle_node` and writes its shuffle blocks.
    ShuffleMap { shuffle_node: NodeId },
    /// Computes the missing partitions of a cached dataset.
    CacheMaterialize,
    /// Computes the action's target.
    Result,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub index: usize,
    pub kind: StageKind,
    /// Node whose partitions the stage's tasks compute
    pub node: NodeId,
    pub num_partitions: usize,
    /// Indices of stages that must finish first
    pub parents: Vec<usize>,
}

/// Builds the stage graph for one job.
pub struct StagePlanner<'a> {
    nodes: &'a HashMap<NodeId, Arc<Node>>,
    marked: &'a HashSet<NodeId>,
    fully_cached: &'a HashSet<NodeId>,
    stages: Vec<Stage>,
    built: HashMap<(NodeId, StageKind), usize>,
}

impl<'a> StagePlanner<'a> {
    /// `marked` are the datasets marked for caching, `fully_cached` those
    /// whose every partition is already available.
    pub fn new(
        nodes: &'a HashMap<NodeId, Arc<Node>>,
        marked: &'a HashSet<NodeId>,
        fully_cached: &'a HashSet<NodeId>,
    ) -> Self {
        Self {
            nodes,
            marked,
            fully_cached,
            stages: Vec::new(),
            built: HashMap::new(),
        }
    }

    pub fn plan(mut self, target: NodeId) -> EngineResult<Vec<Stage>> {
        self.build(target, StageKind::Result)?;
        Ok(self.stages)
    }

    fn node(&self, id: NodeId) -> EngineResult<&'a Arc<Node>> {
        self.nodes.get(&id).ok_or(EngineError::UnknownNode(id))
    }

    fn build(&mut self, node_id: NodeId, kind: StageKind) -> EngineResult<usize> {
        if let Some(index) = self.built.get(&(node_id, kind)) {
            return Ok(*index);
        }

        let mut parents = Vec::new();
        let skip_lineage = kind == StageKind::CacheMaterialize && self.fully_cached.contains(&node_id);
        if !skip_lineage {
            let mut seen = HashSet::new();
            let mut stack = vec![node_id];
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let node = self.node(id)?;
                let own_cache_stage = id == node_id && kind == StageKind::CacheMaterialize;

                if self.marked.contains(&id) && !own_cache_stage {
                    parents.push(self.build(id, StageKind::CacheMaterialize)?);
                } else if node.kind.is_wide() {
                    let parent = node.parent().ok_or(EngineError::UnknownNode(id))?;
                    parents.push(self.build(parent, StageKind::ShuffleMap { shuffle_node: id })?);
                } else {
                    stack.extend(node.parents.iter().copied());
                }
            }
        }
        parents.sort_unstable();
        parents.dedup();

        let index = self.stages.len();
        let num_partitions = self.node(node_id)?.num_partitions;
        self.stages.push(Stage {
            index,
            kind,
            node: node_id,
            num_partitions,
            parents,
        });
        self.built.insert((node_id, kind), index);
        Ok(index)
    }
}

//! Lineage graph.
//!
//! An append-only arena of immutable [`Node`]s. Parents are referenced by
//! index and must exist before a child is added, which keeps the graph
//! acyclic by construction.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::shuffle::Aggregator;
use crate::value::Value;

pub type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(Value) -> Vec<Value> + Send + Sync>;

/// Index of a node in the lineage graph. Doubles as the dataset id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which keyed aggregation a combine node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOp {
    ReduceByKey,
    GroupByKey,
    CombineByKey,
}

/// The transformation a node applies.
#[derive(Clone)]
pub enum NodeKind {
    /// In-memory source, sliced at construction.
    Parallelize { slices: Arc<Vec<Vec<Value>>> },
    /// Lines of a stored text object, split into contiguous partitions.
    TextFile { path: String },
    Map(MapFn),
    Filter(FilterFn),
    FlatMap(FlatMapFn),
    MapValues(MapFn),
    Keys,
    Values,
    Glom,
    /// Output partition `i` concatenates parent partitions `groups[i]`.
    Coalesce { groups: Vec<Vec<usize>> },
    CombineByKey {
        aggregator: Arc<dyn Aggregator>,
        op: CombineOp,
    },
    SortByKey { ascending: bool },
    Repartition,
}

impl NodeKind {
    /// Operation name, as reported in errors and lineage dumps.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Parallelize { .. } => "parallelize",
            NodeKind::TextFile { .. } => "textFile",
            NodeKind::Map(_) => "map",
            NodeKind::Filter(_) => "filter",
            NodeKind::FlatMap(_) => "flatMap",
            NodeKind::MapValues(_) => "mapValues",
            NodeKind::Keys => "keys",
            NodeKind::Values => "values",
            NodeKind::Glom => "glom",
            NodeKind::Coalesce { .. } => "coalesce",
            NodeKind::CombineByKey { op, .. } => match op {
                CombineOp::ReduceByKey => "reduceByKey",
                CombineOp::GroupByKey => "groupByKey",
                CombineOp::CombineByKey => "combineByKey",
            },
            NodeKind::SortByKey { .. } => "sortByKey",
            NodeKind::Repartition => "repartition",
        }
    }

    /// Whether computing this node requires a shuffle of its parent.
    pub fn is_wide(&self) -> bool {
        matches!(
            self,
            NodeKind::CombineByKey { .. } | NodeKind::SortByKey { .. } | NodeKind::Repartition
        )
    }

    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Parallelize { .. } | NodeKind::TextFile { .. })
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::TextFile { path } => write!(f, "textFile({})", path),
            NodeKind::SortByKey { ascending } => write!(f, "sortByKey(ascending={})", ascending),
            NodeKind::Coalesce { groups } => write!(f, "coalesce({:?})", groups),
            other => f.write_str(other.name()),
        }
    }
}

/// One immutable transformation in the graph.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parents: Vec<NodeId>,
    pub num_partitions: usize,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parents.first().copied()
    }
}

/// Append-only arena of nodes.
#[derive(Debug, Default)]
pub struct LineageGraph {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Pure metadata, nothing is computed.
    pub fn add_node(
        &self,
        kind: NodeKind,
        parents: Vec<NodeId>,
        num_partitions: usize,
    ) -> EngineResult<NodeId> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let id = nodes.len();

        // parents must already exist, so no edge can point at a descendant
        if let Some(parent) = parents.iter().find(|p| p.0 >= id) {
            return Err(EngineError::CyclicLineage {
                node: id,
                parent: parent.0,
            });
        }

        nodes.push(Arc::new(Node {
            id: NodeId(id),
            kind,
            parents,
            num_partitions,
        }));
        Ok(NodeId(id))
    }

    /// Add a node derived from nodes handed out by this graph.
    ///
    /// Dataset handles only ever hold ids of existing nodes, so the parent
    /// check of [`add_node`](Self::add_node) cannot fail for them.
    pub(crate) fn append(&self, kind: NodeKind, parents: Vec<NodeId>, num_partitions: usize) -> NodeId {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let id = NodeId(nodes.len());
        debug_assert!(parents.iter().all(|p| *p < id));
        nodes.push(Arc::new(Node {
            id,
            kind,
            parents,
            num_partitions,
        }));
        id
    }

    pub fn get(&self, id: NodeId) -> EngineResult<Arc<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .get(id.0)
            .cloned()
            .ok_or(EngineError::UnknownNode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The node and all of its ancestors, parents before children.
    pub fn resolve(&self, id: NodeId) -> EngineResult<Vec<Arc<Node>>> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.get(next)?.parents.iter().copied());
            }
        }

        // ids grow with insertion order, so sorting by id is a topological order
        let mut ids: Vec<NodeId> = seen.into_iter().collect();
        ids.sort();
        ids.into_iter().map(|id| self.get(id)).collect()
    }

    /// A human readable dump of a node's lineage, one line per node.
    /// Parents of shuffle nodes are indented one level deeper.
    pub fn debug_string(&self, id: NodeId) -> EngineResult<String> {
        let mut lines = Vec::new();
        self.describe(id, 0, &mut lines)?;
        Ok(lines.join("\n"))
    }

    fn describe(&self, id: NodeId, depth: usize, lines: &mut Vec<String>) -> EngineResult<()> {
        let node = self.get(id)?;
        let prefix = if depth == 0 {
            String::new()
        } else {
            format!("{} +-", "  ".repeat(depth - 1))
        };
        lines.push(format!(
            "{}({}) {:?} [{}]",
            prefix, node.num_partitions, node.kind, node.id
        ));
        let child_depth = if node.kind.is_wide() { depth + 1 } else { depth };
        for parent in &node.parents {
            self.describe(*parent, child_depth, lines)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(graph: &LineageGraph) -> NodeId {
        let slices = Arc::new(vec![vec![Value::from(1)], vec![Value::from(2)]]);
        graph
            .add_node(NodeKind::Parallelize { slices }, vec![], 2)
            .unwrap()
    }

    #[test]
    fn test_add_node_rejects_unknown_parents() {
        let graph = LineageGraph::new();
        let src = source(&graph);
        assert_eq!(src, NodeId(0));

        let err = graph
            .add_node(NodeKind::Glom, vec![NodeId(5)], 2)
            .unwrap_err();
        assert!(matches!(err, EngineError::CyclicLineage { node: 1, parent: 5 }));

        // a node can never name itself
        let err = graph
            .add_node(NodeKind::Glom, vec![NodeId(1)], 2)
            .unwrap_err();
        assert!(matches!(err, EngineError::CyclicLineage { .. }));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_resolve_returns_ancestors_in_order() {
        let graph = LineageGraph::new();
        let src = source(&graph);
        let mapped = graph
            .add_node(NodeKind::Map(Arc::new(|v: Value| v)), vec![src], 2)
            .unwrap();
        // a sibling branch that must not show up
        let _other = graph
            .add_node(NodeKind::Filter(Arc::new(|_: &Value| true)), vec![src], 2)
            .unwrap();
        let sorted = graph
            .add_node(NodeKind::SortByKey { ascending: true }, vec![mapped], 3)
            .unwrap();

        let kinds: Vec<&str> = graph
            .resolve(sorted)
            .unwrap()
            .iter()
            .map(|n| n.kind.name())
            .collect();
        assert_eq!(kinds, vec!["parallelize", "map", "sortByKey"]);
    }

    #[test]
    fn test_nodes_are_immutable_under_branching() {
        let graph = LineageGraph::new();
        let src = source(&graph);
        let a = graph.add_node(NodeKind::Keys, vec![src], 2).unwrap();
        let b = graph.add_node(NodeKind::Values, vec![src], 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(graph.get(a).unwrap().parent(), Some(src));
        assert_eq!(graph.get(b).unwrap().parent(), Some(src));
        assert!(graph.get(NodeId(99)).is_err());
    }

    #[test]
    fn test_debug_string_indents_shuffle_parents() {
        let graph = LineageGraph::new();
        let src = source(&graph);
        let shuffled = graph.add_node(NodeKind::Repartition, vec![src], 4).unwrap();
        let dump = graph.debug_string(shuffled).unwrap();
        assert_eq!(dump, "(4) repartition [1]\n +-(2) parallelize [0]");
    }
}

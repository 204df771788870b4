//! Engine error types.

use ember_common::CommonError;
use thiserror::Error;

use crate::cache::StorageLevel;
use crate::lineage::NodeId;

/// Errors surfaced to callers of the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Cyclic lineage: node {node} references unknown or later node {parent}")]
    CyclicLineage { node: usize, parent: usize },

    #[error("Cannot coalesce {current} partitions into {requested}; use repartition to increase")]
    InvalidCoalesce { current: usize, requested: usize },

    #[error("Task failed: {0}")]
    TaskExecution(#[from] TaskError),

    #[error("Stage {stage} failed in {node_kind}: {source}")]
    StageFailed {
        stage: usize,
        node_kind: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Shuffle {shuffle} output was aborted")]
    ShuffleWriteAborted { shuffle: usize },

    #[error("Storage budget exceeded: {needed} bytes needed, {available} available")]
    StorageBudgetExceeded { needed: usize, available: usize },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot change storage level of dataset {node} from {current:?} to {requested:?}")]
    StorageLevelChange {
        node: NodeId,
        current: StorageLevel,
        requested: StorageLevel,
    },

    #[error("Context has been stopped")]
    ContextStopped,

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error(transparent)]
    Common(#[from] CommonError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Stage index of a stage failure.
    pub fn stage(&self) -> Option<usize> {
        match self {
            EngineError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Node kind that originated a stage failure.
    pub fn node_kind(&self) -> Option<&str> {
        match self {
            EngineError::StageFailed { node_kind, .. } => Some(node_kind),
            EngineError::TaskExecution(task) => Some(&task.node_kind),
            _ => None,
        }
    }

    /// Innermost engine error of a stage failure chain.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), EngineError::Cancelled)
    }
}

/// What went wrong inside a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskErrorKind {
    #[error("user function panicked: {0}")]
    UserFunction(String),
    #[error("expected a key/value pair, found {0}")]
    NotAPair(String),
    #[error("{0}")]
    Storage(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("shuffle {0} input unavailable")]
    ShuffleAborted(usize),
    #[error("worker lost")]
    WorkerLost,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Worker side failure, tagged with the node kind being evaluated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{node_kind}: {kind}")]
pub struct TaskError {
    pub node_kind: String,
    pub kind: TaskErrorKind,
}

impl TaskError {
    pub fn new(node_kind: impl Into<String>, kind: TaskErrorKind) -> Self {
        Self {
            node_kind: node_kind.into(),
            kind,
        }
    }

    pub fn cancelled(node_kind: impl Into<String>) -> Self {
        Self::new(node_kind, TaskErrorKind::Cancelled)
    }

    /// Whether running the task again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TaskErrorKind::UserFunction(_) | TaskErrorKind::Storage(_) | TaskErrorKind::WorkerLost
        )
    }
}

/// Convert a panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Scheduling: stage planning, task evaluation and the worker pool.
//!
//! The [`DagScheduler`] owns job execution; tasks run on a [`WorkerPool`],
//! which by default is a Rayon thread pool.

pub mod dag_scheduler;
pub mod stage;
pub mod task;
pub mod worker_pool;

pub use dag_scheduler::{ActionKind, ActionResult, DagScheduler};
pub use stage::{Stage, StageKind, StagePlanner};
pub use task::{ForeachFn, TaskContext, TaskOutput};
pub use worker_pool::{RayonWorkerPool, TaskFn, WorkerPool};

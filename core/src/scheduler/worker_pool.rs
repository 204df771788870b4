//! Worker pool.
//!
//! The scheduler only depends on [`WorkerPool::submit`]; how tasks are
//! hosted is up to the implementation. [`RayonWorkerPool`] runs them on a
//! fixed-size Rayon thread pool, queueing when every worker is busy.

use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};

use ember_common::CommonError;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use super::task::TaskOutput;
use crate::error::{TaskError, TaskErrorKind, panic_message};

/// A unit of work handed to a worker.
pub type TaskFn = Box<dyn FnOnce() -> Result<TaskOutput, TaskError> + Send + 'static>;

/// Executes tasks and reports their results asynchronously.
pub trait WorkerPool: Send + Sync + Debug {
    /// Queue a task; the future resolves once a worker has run it.
    fn submit(&self, task: TaskFn) -> BoxFuture<'static, Result<TaskOutput, TaskError>>;

    fn num_workers(&self) -> usize;
}

/// WorkerPool backed by a dedicated Rayon thread pool
#[derive(Debug)]
pub struct RayonWorkerPool {
    pool: rayon::ThreadPool,
    num_workers: usize,
}

impl RayonWorkerPool {
    /// Create a pool with the specified number of threads
    pub fn new(num_workers: usize) -> Result<Self, CommonError> {
        let num_workers = num_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("ember-worker-{}", i))
            .build()
            .map_err(|e| CommonError::internal_error_with_source("Failed to build worker pool", e))?;
        Ok(Self { pool, num_workers })
    }
}

impl WorkerPool for RayonWorkerPool {
    fn submit(&self, task: TaskFn) -> BoxFuture<'static, Result<TaskOutput, TaskError>> {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
                Err(TaskError::new(
                    "task",
                    TaskErrorKind::UserFunction(panic_message(payload.as_ref())),
                ))
            });
            // the receiver is gone when the job was abandoned
            let _ = tx.send(result);
        });

        async move {
            rx.await
                .unwrap_or_else(|_| Err(TaskError::new("task", TaskErrorKind::WorkerLost)))
        }
        .boxed()
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use futures::future::join_all;

    #[tokio::test]
    async fn test_submit_runs_on_named_workers() {
        let pool = RayonWorkerPool::new(2).unwrap();
        assert_eq!(pool.num_workers(), 2);

        let output = pool
            .submit(Box::new(|| -> Result<TaskOutput, TaskError> {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                Ok(TaskOutput::Records(vec![Value::from(name)]))
            }))
            .await
            .unwrap();

        match output {
            TaskOutput::Records(records) => {
                let name = records[0].as_str().unwrap().to_string();
                assert!(name.starts_with("ember-worker-"), "{name}");
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_more_tasks_than_workers_queue() {
        let pool = RayonWorkerPool::new(1).unwrap();
        let futures: Vec<_> = (0..8)
            .map(|i: i64| {
                pool.submit(Box::new(move || -> Result<TaskOutput, TaskError> {
                    Ok(TaskOutput::Records(vec![Value::from(i)]))
                }))
            })
            .collect();
        let results = join_all(futures).await;
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_panics_become_task_errors() {
        let pool = RayonWorkerPool::new(1).unwrap();
        let err = pool
            .submit(Box::new(|| -> Result<TaskOutput, TaskError> {
                panic!("worker exploded")
            }))
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            TaskErrorKind::UserFunction("worker exploded".to_string())
        );
    }
}

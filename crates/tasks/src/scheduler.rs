//! Bounded execution of submitted tasks, plus the two result-joining
//! entry points mirrored from the operation-queue experiment.

use std::sync::Arc;

use flow::{combine_latest, merge, Flow};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{Task, TaskResult};

/// Schedules tasks onto the tokio runtime behind a concurrency bound.
/// Result delivery happens through each task's own `result_flow`, not
/// through the scheduler.
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Enqueues tasks for execution without blocking the caller.
    /// Fire and forget: a task that cannot start (wrong lifecycle
    /// state) is logged and dropped.
    pub fn submit<T: Send + Sync + 'static>(&self, tasks: Vec<Arc<Task<T>>>) {
        for task in tasks {
            let permits = Arc::clone(&self.permits);
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(error) = task.run().await {
                    warn!(task_id = %task.id(), %error, "task could not be started");
                }
            });
        }
    }

    /// Joins two task results with combine-latest and submits both.
    /// The single combined value arrives only after both tasks finish;
    /// subscribing after they finished is safe thanks to result
    /// replay.
    pub fn combine_results<A, B>(
        &self,
        a: Arc<Task<A>>,
        b: Arc<Task<B>>,
    ) -> Flow<(TaskResult<A>, TaskResult<B>)>
    where
        A: Clone + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
    {
        let combined = combine_latest(a.result_flow(), b.result_flow());
        self.submit(vec![a]);
        self.submit(vec![b]);
        combined
    }

    /// Interleaves two task results and submits both: one event per
    /// completion, in completion order.
    pub fn merge_results<T>(&self, a: Arc<Task<T>>, b: Arc<Task<T>>) -> Flow<TaskResult<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let merged = merge(a.result_flow(), b.result_flow());
        self.submit(vec![a, b]);
        merged
    }
}

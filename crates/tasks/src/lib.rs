//! Asynchronous units of work with an observable lifecycle.
//!
//! A [`Task`] wraps a one-shot async body behind an explicit state
//! machine (`Pending -> Running -> Finished`, with `Cancelled` as the
//! terminal for honored cancellations). The terminal result is stored
//! and replayed, so observers that subscribe after completion still
//! receive it.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::anyhow;
use flow::Flow;
use futures::future::BoxFuture;
use shared::{
    domain::{TaskId, TaskState},
    error::{InvalidStateError, TaskFailure},
};
use tokio::sync::watch;
use tracing::debug;

mod scheduler;
pub use scheduler::TaskScheduler;

/// Terminal result of a task: the work body's value, or a cloneable
/// failure (including the cancelled terminal).
pub type TaskResult<T> = Result<T, TaskFailure>;

/// Observer hooks fire once before and once after every state
/// mutation, carrying the old and new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    Before,
    After,
}

type TransitionHook = Box<dyn Fn(TransitionPhase, TaskState, TaskState) + Send + Sync>;

type TaskWork<T> = Box<dyn FnOnce(TaskHandle<T>) -> BoxFuture<'static, TaskResult<T>> + Send>;

struct TaskCore<T> {
    id: TaskId,
    state: Mutex<TaskState>,
    cancelled: AtomicBool,
    result: watch::Sender<Option<TaskResult<T>>>,
    transition_hooks: Mutex<Vec<TransitionHook>>,
}

impl<T> TaskCore<T> {
    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a validated state transition. The decision and the
    /// mutation happen atomically under the state lock; hooks are
    /// notified with the old/new pair once the swap is committed.
    fn advance<F>(&self, decide: F) -> Result<(TaskState, TaskState), InvalidStateError>
    where
        F: FnOnce(TaskState) -> Result<TaskState, InvalidStateError>,
    {
        let (from, to) = {
            let mut guard = self.lock_state();
            let from = *guard;
            let to = decide(from)?;
            *guard = to;
            (from, to)
        };
        self.notify(TransitionPhase::Before, from, to);
        self.notify(TransitionPhase::After, from, to);
        Ok((from, to))
    }

    fn notify(&self, phase: TransitionPhase, from: TaskState, to: TaskState) {
        let hooks = self
            .transition_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for hook in hooks.iter() {
            hook(phase, from, to);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stores the terminal result at most once and transitions to the
    /// matching terminal state. The second caller gets
    /// [`InvalidStateError`].
    fn finish(&self, result: TaskResult<T>) -> Result<(), InvalidStateError> {
        let target = if matches!(result, Err(TaskFailure::Cancelled)) || self.is_cancelled() {
            TaskState::Cancelled
        } else {
            TaskState::Finished
        };
        self.advance(|state| {
            if state.is_terminal() {
                Err(InvalidStateError::AlreadyTerminal { actual: state })
            } else {
                Ok(target)
            }
        })?;
        // Only the transition winner reaches this write.
        self.result.send_replace(Some(result));
        Ok(())
    }
}

/// Handle passed to the work body: identity plus the cancellation
/// flag, checked at the body's own checkpoints.
pub struct TaskHandle<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }
}

/// A one-shot asynchronous unit of work with observable lifecycle
/// state and replayable terminal result.
pub struct Task<T: Send + Sync + 'static> {
    core: Arc<TaskCore<T>>,
    work: Mutex<Option<TaskWork<T>>>,
}

impl<T: Send + Sync + 'static> Task<T> {
    pub fn new<F, Fut>(work: F) -> Arc<Self>
    where
        F: FnOnce(TaskHandle<T>) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let (result, _) = watch::channel(None);
        Arc::new(Self {
            core: Arc::new(TaskCore {
                id: TaskId::new(),
                state: Mutex::new(TaskState::Pending),
                cancelled: AtomicBool::new(false),
                result,
                transition_hooks: Mutex::new(Vec::new()),
            }),
            work: Mutex::new(Some(Box::new(move |handle| Box::pin(work(handle))))),
        })
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Thread-safe read of the lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.core.lock_state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Requests cancellation. Sets the flag only; the running body is
    /// expected to observe it at a checkpoint and return, after which
    /// the task lands in the `Cancelled` terminal.
    pub fn cancel(&self) {
        self.core.cancelled.store(true, Ordering::Release);
    }

    /// Registers a transition observer, called with `Before` and
    /// `After` phases around every state mutation. Hooks must not call
    /// back into the task.
    pub fn observe_transitions(
        &self,
        hook: impl Fn(TransitionPhase, TaskState, TaskState) + Send + Sync + 'static,
    ) {
        self.core
            .transition_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Completes the task externally. Callable at most once; a second
    /// call (or a call after the body finished) is
    /// [`InvalidStateError`].
    pub fn finish(&self, result: TaskResult<T>) -> Result<(), InvalidStateError> {
        self.core.finish(result)
    }

    /// Starts and drives the work body to completion on the current
    /// tokio task.
    ///
    /// Fails with [`InvalidStateError`] unless the task is `Pending`.
    /// A pre-set cancellation flag finishes the task with the
    /// `Cancelled` terminal without running the body. If the flag is
    /// set by the time the body returns, the terminal is `Cancelled`
    /// regardless of the body's value.
    pub async fn run(&self) -> Result<(), InvalidStateError> {
        if self.core.is_cancelled() {
            let state = self.state();
            if state != TaskState::Pending {
                return Err(InvalidStateError::Unexpected {
                    expected: TaskState::Pending,
                    actual: state,
                });
            }
            if let Err(error) = self.core.finish(Err(TaskFailure::Cancelled)) {
                debug!(task_id = %self.core.id, %error, "cancelled task already finished");
            }
            return Ok(());
        }

        self.core.advance(|state| match state {
            TaskState::Pending => Ok(TaskState::Running),
            other => Err(InvalidStateError::Unexpected {
                expected: TaskState::Pending,
                actual: other,
            }),
        })?;

        let work = self
            .work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(work) = work else {
            // Unreachable in practice: the Pending->Running gate has a
            // single winner, and only the winner takes the body.
            return Ok(());
        };

        let handle = TaskHandle {
            core: Arc::clone(&self.core),
        };
        let outcome = work(handle).await;
        let result = if self.core.is_cancelled() {
            Err(TaskFailure::Cancelled)
        } else {
            outcome
        };
        if let Err(error) = self.core.finish(result) {
            debug!(task_id = %self.core.id, %error, "task already finished externally");
        }
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    /// The task's terminal result as a one-shot flow with
    /// replay-last-value semantics: subscribing after the task
    /// finished still delivers the stored result exactly once.
    pub fn result_flow(&self) -> Flow<TaskResult<T>> {
        let mut stored = self.core.result.subscribe();
        let task_id = self.core.id;
        Flow::new(move |emitter| {
            tokio::spawn(async move {
                let cancelled = emitter.cancelled();
                tokio::pin!(cancelled);
                loop {
                    let existing = stored.borrow_and_update().clone();
                    if let Some(result) = existing {
                        emitter.emit(result);
                        emitter.complete();
                        break;
                    }
                    tokio::select! {
                        _ = &mut cancelled => break,
                        changed = stored.changed() => {
                            if changed.is_err() {
                                emitter.fail(anyhow!(
                                    "task {task_id} dropped before finishing"
                                ));
                                break;
                            }
                        }
                    }
                }
            });
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use flow::{FlowEvent, FlowOutcome};
use shared::{
    domain::TaskState,
    error::{InvalidStateError, TaskFailure},
};
use tokio::{sync::mpsc, time::timeout};

use crate::{Task, TransitionPhase};

const TICK: Duration = Duration::from_millis(500);

#[tokio::test]
async fn run_drives_the_task_to_finished() {
    let task = Task::new(|_handle| async { Ok(11) });
    assert_eq!(task.state(), TaskState::Pending);

    task.run().await.unwrap();
    assert_eq!(task.state(), TaskState::Finished);
}

#[tokio::test]
async fn second_run_is_rejected() {
    let task = Task::new(|_handle| async { Ok(1) });
    task.run().await.unwrap();

    let error = task.run().await.unwrap_err();
    assert_eq!(
        error,
        InvalidStateError::Unexpected {
            expected: TaskState::Pending,
            actual: TaskState::Finished,
        }
    );
}

#[tokio::test]
async fn external_finish_is_at_most_once() {
    let task: Arc<Task<i32>> = Task::new(|_handle| async { Ok(0) });
    task.finish(Ok(5)).unwrap();
    assert_eq!(task.state(), TaskState::Finished);

    let error = task.finish(Ok(6)).unwrap_err();
    assert_eq!(
        error,
        InvalidStateError::AlreadyTerminal {
            actual: TaskState::Finished,
        }
    );
}

#[tokio::test]
async fn run_after_external_finish_is_rejected() {
    let ran = Arc::new(AtomicBool::new(false));
    let task = Task::new({
        let ran = Arc::clone(&ran);
        move |_handle| async move {
            ran.store(true, Ordering::SeqCst);
            Ok(1)
        }
    });
    task.finish(Ok(9)).unwrap();

    assert!(task.run().await.is_err());
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancel_before_run_skips_the_body() {
    let ran = Arc::new(AtomicBool::new(false));
    let task = Task::new({
        let ran = Arc::clone(&ran);
        move |_handle| async move {
            ran.store(true, Ordering::SeqCst);
            Ok(1)
        }
    });
    task.cancel();
    task.run().await.unwrap();

    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(!ran.load(Ordering::SeqCst));

    let (values, _) = task.result_flow().subscribe().collect().await;
    assert_eq!(values, vec![Err(TaskFailure::Cancelled)]);
}

#[tokio::test]
async fn cancel_during_run_wins_over_the_body_value() {
    let (checkpoint_tx, mut checkpoint_rx) = mpsc::unbounded_channel::<()>();
    let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
    let task = Task::new(move |_handle| async move {
        checkpoint_tx.send(()).ok();
        resume_rx.await.ok();
        Ok(42)
    });

    let runner = {
        let task = Arc::clone(&task);
        tokio::spawn(async move { task.run().await })
    };
    timeout(TICK, checkpoint_rx.recv()).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Running);

    task.cancel();
    resume_tx.send(()).unwrap();
    timeout(TICK, runner).await.unwrap().unwrap().unwrap();

    assert_eq!(task.state(), TaskState::Cancelled);
    let (values, _) = task.result_flow().subscribe().collect().await;
    assert_eq!(values, vec![Err(TaskFailure::Cancelled)]);
}

#[tokio::test]
async fn body_observes_the_cancellation_flag() {
    let task = Task::new(|handle| async move {
        if handle.is_cancelled() {
            return Err(TaskFailure::Cancelled);
        }
        Ok("reached")
    });
    task.run().await.unwrap();
    assert_eq!(task.state(), TaskState::Finished);
}

#[tokio::test]
async fn transition_hooks_fire_before_and_after_each_change() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let task = Task::new(|_handle| async { Ok(1) });
    task.observe_transitions({
        let log = Arc::clone(&log);
        move |phase, from, to| log.lock().unwrap().push((phase, from, to))
    });
    task.run().await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            (TransitionPhase::Before, TaskState::Pending, TaskState::Running),
            (TransitionPhase::After, TaskState::Pending, TaskState::Running),
            (TransitionPhase::Before, TaskState::Running, TaskState::Finished),
            (TransitionPhase::After, TaskState::Running, TaskState::Finished),
        ]
    );
}

#[tokio::test]
async fn result_flow_replays_after_the_task_finished() {
    let task = Task::new(|_handle| async { Ok("done") });
    task.run().await.unwrap();

    // Late subscriber still sees the stored terminal result.
    let (values, outcome) = timeout(TICK, task.result_flow().subscribe().collect())
        .await
        .unwrap();
    assert_eq!(values, vec![Ok("done")]);
    assert!(matches!(outcome, Some(FlowOutcome::Finished)));
}

#[tokio::test]
async fn result_flow_resolves_when_the_task_later_finishes() {
    let task: Arc<Task<i32>> = Task::new(|_handle| async { Ok(3) });
    let mut subscription = task.result_flow().subscribe();

    let runner = {
        let task = Arc::clone(&task);
        tokio::spawn(async move { task.run().await })
    };
    let event = timeout(TICK, subscription.recv()).await.unwrap();
    assert!(matches!(event, Some(FlowEvent::Value(Ok(3)))));
    timeout(TICK, runner).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn result_flow_fails_if_the_task_is_dropped_unfinished() {
    let task: Arc<Task<i32>> = Task::new(|_handle| async { Ok(0) });
    let flow = task.result_flow();
    drop(task);

    let (values, outcome) = timeout(TICK, flow.subscribe().collect()).await.unwrap();
    assert!(values.is_empty());
    let Some(FlowOutcome::Failed(error)) = outcome else {
        panic!("expected failure terminal");
    };
    assert!(error.to_string().contains("dropped before finishing"));
}

#[tokio::test]
async fn failed_body_surfaces_a_cloneable_failure() {
    let task: Arc<Task<i32>> = Task::new(|_handle| async {
        Err(TaskFailure::Failed("disk on fire".to_string()))
    });
    task.run().await.unwrap();
    assert_eq!(task.state(), TaskState::Finished);

    let (values, _) = task.result_flow().subscribe().collect().await;
    assert_eq!(values, vec![Err(TaskFailure::Failed("disk on fire".to_string()))]);
}

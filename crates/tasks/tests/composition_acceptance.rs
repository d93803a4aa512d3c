//! End-to-end scheduler scenarios: bounded execution plus the two
//! result-joining entry points over real tokio time.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use flow::{FlowEvent, FlowOutcome};
use shared::error::TaskFailure;
use tasks::{Task, TaskScheduler};
use tokio::time::{sleep, timeout};

const TICK: Duration = Duration::from_secs(2);

fn sleepy_task<T: Send + Sync + 'static>(delay: Duration, value: T) -> Arc<Task<T>> {
    Task::new(move |_handle| async move {
        sleep(delay).await;
        Ok(value)
    })
}

#[tokio::test]
async fn combine_results_delivers_one_pair_after_both_finish() {
    let scheduler = TaskScheduler::new(2);
    let a = sleepy_task(Duration::from_millis(10), 6);
    let b = sleepy_task(Duration::from_millis(30), "six".to_string());

    let (values, outcome) = timeout(
        TICK,
        scheduler.combine_results(a, b).subscribe().collect(),
    )
    .await
    .unwrap();

    // One pair per side once both have a result, then completion.
    let last = values.last().unwrap();
    assert_eq!(last.0, Ok(6));
    assert_eq!(last.1, Ok("six".to_string()));
    assert!(matches!(outcome, Some(FlowOutcome::Finished)));
}

#[tokio::test]
async fn combine_results_carries_a_failed_side_as_a_value() {
    let scheduler = TaskScheduler::new(2);
    let ok = sleepy_task(Duration::from_millis(5), 1);
    let broken: Arc<Task<i32>> = Task::new(|_handle| async {
        Err(TaskFailure::Failed("backend said no".to_string()))
    });

    let (values, outcome) = timeout(
        TICK,
        scheduler.combine_results(ok, broken).subscribe().collect(),
    )
    .await
    .unwrap();

    let last = values.last().unwrap();
    assert_eq!(last.0, Ok(1));
    assert_eq!(
        last.1,
        Err(TaskFailure::Failed("backend said no".to_string()))
    );
    assert!(matches!(outcome, Some(FlowOutcome::Finished)));
}

#[tokio::test]
async fn merge_results_yields_results_in_completion_order() {
    let scheduler = TaskScheduler::new(2);
    let slow = sleepy_task(Duration::from_millis(60), "slow");
    let fast = sleepy_task(Duration::from_millis(5), "fast");

    let mut merged = scheduler.merge_results(slow, fast).subscribe();

    let first = timeout(TICK, merged.recv()).await.unwrap();
    assert!(matches!(first, Some(FlowEvent::Value(Ok("fast")))));
    let second = timeout(TICK, merged.recv()).await.unwrap();
    assert!(matches!(second, Some(FlowEvent::Value(Ok("slow")))));
    let terminal = timeout(TICK, merged.recv()).await.unwrap();
    assert!(matches!(terminal, Some(FlowEvent::Completed)));
}

#[tokio::test]
async fn late_subscriber_after_a_scheduled_run_still_gets_the_result() {
    let scheduler = TaskScheduler::new(2);
    let task = sleepy_task(Duration::from_millis(5), "stored".to_string());

    let mut live = task.result_flow().subscribe();
    scheduler.submit(vec![Arc::clone(&task)]);
    let event = timeout(TICK, live.recv()).await.unwrap();
    assert!(matches!(event, Some(FlowEvent::Value(Ok(_)))));

    // A subscription opened only after the run finished replays the
    // stored terminal result.
    let (values, outcome) = timeout(TICK, task.result_flow().subscribe().collect())
        .await
        .unwrap();
    assert_eq!(values, vec![Ok("stored".to_string())]);
    assert!(matches!(outcome, Some(FlowOutcome::Finished)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduler_honors_the_concurrency_bound() {
    let scheduler = TaskScheduler::new(1);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..4)
        .map(|n| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Task::new(move |_handle| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            })
        })
        .collect();

    let flows: Vec<_> = tasks.iter().map(|task| task.result_flow()).collect();
    scheduler.submit(tasks);

    for flow in flows {
        let (values, _) = timeout(TICK, flow.subscribe().collect()).await.unwrap();
        assert_eq!(values.len(), 1);
        assert!(values[0].is_ok());
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use orbital_core::{Args, ConflictPolicy, DataStore, DateTrigger, IntervalTrigger, Schedule, TaskRegistry, Trigger};
use orbital_runtime::{Config, Scheduler, Worker};
use orbital_store::MemoryDataStore;
use tokio::sync::Notify;

fn test_config() -> Config {
    Config {
        max_poll_time: StdDuration::from_millis(20),
        ..Config::default()
    }
}

async fn wait_for(notify: &Notify) {
    tokio::time::timeout(StdDuration::from_secs(5), notify.notified())
        .await
        .expect("expected event within timeout");
}

/// S1: a one-shot schedule produces exactly one completed job and is then
/// removed from the store.
#[tokio::test]
async fn one_shot_schedule_completes_and_is_removed() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());

    let mut registry = TaskRegistry::new();
    registry.register("tasks::answer", |_args: &Args| async { Ok(serde_json::json!(42)) });
    let registry = Arc::new(registry);

    let fire_time = Utc::now() + ChronoDuration::milliseconds(30);
    let mut schedule = Schedule::new("s1", "tasks::answer", DateTrigger::new(fire_time));
    schedule.next_fire_time = Some(fire_time);
    store.add_schedule(schedule, ConflictPolicy::Exception).await.unwrap();

    let mut scheduler = Scheduler::new("sched-1", store.clone(), registry.clone(), test_config());
    let mut worker = Worker::new("worker-1", store.clone(), registry.clone(), test_config());

    let completed = Arc::new(Notify::new());
    let completed_signal = completed.clone();
    worker
        .event_hub()
        .subscribe(Some(vec!["JobCompleted"]), move |_event| completed_signal.notify_one());

    let scheduler_handle = scheduler.handle();
    let worker_handle = worker.handle();

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });
    let worker_task = tokio::spawn(async move { worker.run().await });

    wait_for(&completed).await;

    // Give the scheduler one more cycle to observe the now-terminal schedule
    // and release it as removed.
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    scheduler_handle.shutdown();
    worker_handle.shutdown();
    scheduler_task.await.unwrap().unwrap();
    worker_task.await.unwrap().unwrap();

    assert!(store.get_schedules(None).await.unwrap().is_empty());
    assert!(store.get_jobs(None).await.unwrap().is_empty());
}

/// S4: a job whose start deadline has already passed when the worker picks
/// it up is skipped with a deadline-missed outcome, never executed.
#[tokio::test]
async fn deadline_missed_job_is_skipped_not_executed() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());

    let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let invoked_flag = invoked.clone();
    let mut registry = TaskRegistry::new();
    registry.register("tasks::noop", move |_args: &Args| {
        let invoked_flag = invoked_flag.clone();
        async move {
            invoked_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    });
    let registry = Arc::new(registry);

    let now = Utc::now();
    let mut job = orbital_core::Job::new("tasks::noop", now - ChronoDuration::seconds(10));
    job.start_deadline = Some(now - ChronoDuration::seconds(9));
    store.add_job(job).await.unwrap();

    let mut worker = Worker::new("worker-1", store.clone(), registry.clone(), test_config());

    let missed = Arc::new(Notify::new());
    let missed_signal = missed.clone();
    worker
        .event_hub()
        .subscribe(Some(vec!["JobDeadlineMissed"]), move |_event| missed_signal.notify_one());

    let worker_handle = worker.handle();
    let worker_task = tokio::spawn(async move { worker.run().await });

    wait_for(&missed).await;
    tokio::time::sleep(StdDuration::from_millis(20)).await;

    worker_handle.shutdown();
    worker_task.await.unwrap().unwrap();

    assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    assert!(store.get_jobs(None).await.unwrap().is_empty());
}

/// S2/S3: coalescence policies compress multiple past-due firings at
/// acquisition time into either one job per firing (`all`) or a single job
/// (`latest`).
#[tokio::test]
async fn coalesce_all_emits_one_job_per_past_due_firing() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::default());
    let mut registry = TaskRegistry::new();
    registry.register("tasks::noop", |_args: &Args| async { Ok(serde_json::Value::Null) });
    let registry = Arc::new(registry);

    let now = Utc::now();
    let anchor = now - ChronoDuration::seconds(12);
    let mut trigger =
        IntervalTrigger::new(anchor, ChronoDuration::seconds(5)).with_end_time(now + ChronoDuration::hours(1));
    // The first fire time is already reflected in `next_fire_time` below, the
    // way a prior acquire cycle would have left it; only the firings after
    // it are discovered when the scheduler advances the trigger further.
    let first = trigger.next(anchor).unwrap();

    let mut schedule = Schedule::new("s1", "tasks::noop", trigger);
    schedule.coalesce = orbital_core::CoalescePolicy::All;
    schedule.next_fire_time = Some(first);
    store.add_schedule(schedule, ConflictPolicy::Exception).await.unwrap();

    let scheduler = Scheduler::new("sched-1", store.clone(), registry.clone(), test_config());
    let handle = scheduler.handle();
    let mut scheduler = scheduler;

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });
    tokio::time::sleep(StdDuration::from_millis(60)).await;
    handle.shutdown();
    scheduler_task.await.unwrap().unwrap();

    let jobs = store.get_jobs(None).await.unwrap();
    assert_eq!(jobs.len(), 3, "expected one job per past-due firing");
}

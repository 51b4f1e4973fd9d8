//! Integration tests against a real Postgres instance.
//!
//! Requires a reachable database; run with:
//! `DATABASE_URL=postgres://... cargo test -p orbital-store --test postgres -- --ignored`

use chrono::{Duration, Utc};
use orbital_core::{ConflictPolicy, DataStore, DateTrigger, Job, Schedule};
use orbital_store::PostgresDataStore;

async fn test_store() -> PostgresDataStore {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set to run this test");
    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .expect("failed to connect to DATABASE_URL");

    let store = PostgresDataStore::open(pool, Duration::seconds(30))
        .await
        .expect("failed to open Postgres data store");
    store.clear().await.expect("failed to clear prior test data");
    store
}

fn schedule(id: &str, next_fire_time: chrono::DateTime<Utc>) -> Schedule {
    let mut s = Schedule::new(id, "tasks::noop", DateTrigger::new(next_fire_time));
    s.next_fire_time = Some(next_fire_time);
    s
}

#[tokio::test]
#[ignore] // Requires database
async fn acquire_schedules_claims_rows_under_skip_locked() {
    let store = test_store().await;
    let now = Utc::now();

    store
        .add_schedule(schedule("a", now - Duration::seconds(5)), ConflictPolicy::Exception)
        .await
        .unwrap();
    store
        .add_schedule(schedule("b", now - Duration::seconds(1)), ConflictPolicy::Exception)
        .await
        .unwrap();

    let acquired = store.acquire_schedules("sched-1", 10).await.unwrap();
    let ids: Vec<_> = acquired.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    // Still locked under sched-1's lease: a second scheduler gets nothing.
    let second = store.acquire_schedules("sched-2", 10).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
#[ignore] // Requires database
async fn release_schedules_unlocks_rows_for_other_schedulers() {
    let store = test_store().await;
    let now = Utc::now();
    store
        .add_schedule(schedule("s1", now - Duration::seconds(1)), ConflictPolicy::Exception)
        .await
        .unwrap();

    let acquired = store.acquire_schedules("sched-1", 10).await.unwrap();
    assert_eq!(acquired.len(), 1);

    store.release_schedules("sched-1", acquired).await.unwrap();

    // The trigger had no further fire time, so the schedule is now terminal
    // and was removed on release rather than becoming reacquirable.
    assert!(store.get_schedules(None).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires database
async fn acquire_jobs_is_mutually_exclusive_across_workers() {
    let store = test_store().await;
    store.add_job(Job::new("tasks::noop", Utc::now())).await.unwrap();

    let first = store.acquire_jobs("worker-1", 10).await.unwrap();
    assert_eq!(first.len(), 1);

    let second = store.acquire_jobs("worker-2", 10).await.unwrap();
    assert!(second.is_empty());

    store.release_jobs("worker-1", &first).await.unwrap();
    assert!(store.get_jobs(None).await.unwrap().is_empty());
}

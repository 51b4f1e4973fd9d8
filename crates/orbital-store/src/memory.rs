use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use orbital_core::{
    CoreError, CoreResult, DataStore, Event, EventHub,
};
use orbital_core::model::{ConflictPolicy, Job, Schedule};
use orbital_core::store::{Clock, SystemClock};
use parking_lot::Mutex;
use uuid::Uuid;

struct State {
    schedules: BTreeMap<String, Schedule>,
    jobs: BTreeMap<Uuid, Job>,
}

impl State {
    fn new() -> Self {
        Self {
            schedules: BTreeMap::new(),
            jobs: BTreeMap::new(),
        }
    }
}

/// An in-memory reference [`DataStore`] implementation: sorted containers
/// keyed by id and, for acquisition, by fire time. Intended for tests and
/// single-process deployments, not for sharing across machines.
pub struct MemoryDataStore {
    state: Mutex<State>,
    hub: EventHub,
    clock: Arc<dyn Clock>,
    lock_expiration_delay: Duration,
}

impl MemoryDataStore {
    pub fn new(lock_expiration_delay: Duration) -> Self {
        Self::with_clock(lock_expiration_delay, Arc::new(SystemClock))
    }

    pub fn with_clock(lock_expiration_delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::new()),
            hub: EventHub::new(),
            clock,
            lock_expiration_delay,
        }
    }
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new(Duration::seconds(30))
    }
}

#[async_trait::async_trait]
impl DataStore for MemoryDataStore {
    async fn add_schedule(&self, schedule: Schedule, policy: ConflictPolicy) -> CoreResult<()> {
        let event = {
            let mut state = self.state.lock();

            if let Some(existing) = state.schedules.get(&schedule.id) {
                let _ = existing;
                match policy {
                    ConflictPolicy::DoNothing => return Ok(()),
                    ConflictPolicy::Exception => {
                        return Err(CoreError::ConflictingId {
                            id: schedule.id.clone(),
                        })
                    }
                    ConflictPolicy::Replace => {
                        let id = schedule.id.clone();
                        state.schedules.insert(id.clone(), schedule);
                        Event::schedule_updated(id)
                    }
                }
            } else {
                let id = schedule.id.clone();
                state.schedules.insert(id.clone(), schedule);
                Event::schedule_added(id)
            }
        };

        self.hub.publish(event).await;
        Ok(())
    }

    async fn remove_schedules(&self, ids: &[String]) -> CoreResult<()> {
        let now = self.clock.now();
        let removed: Vec<String> = {
            let mut state = self.state.lock();
            ids.iter()
                .filter(|id| {
                    let locked = state
                        .schedules
                        .get(*id)
                        .is_some_and(|s| s.is_locked(now));
                    !locked
                })
                .filter_map(|id| state.schedules.remove(id).map(|_| id.clone()))
                .collect()
        };

        for id in removed {
            self.hub.publish(Event::schedule_removed(id)).await;
        }
        Ok(())
    }

    async fn get_schedules(&self, ids: Option<&[String]>) -> CoreResult<Vec<Schedule>> {
        let state = self.state.lock();
        let schedules = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.schedules.get(id).cloned())
                .collect(),
            None => state.schedules.values().cloned().collect(),
        };
        Ok(schedules)
    }

    async fn acquire_schedules(&self, scheduler_id: &str, limit: usize) -> CoreResult<Vec<Schedule>> {
        let now = self.clock.now();
        let until = now + self.lock_expiration_delay;

        let mut state = self.state.lock();
        let mut due: Vec<_> = state
            .schedules
            .values()
            .filter(|s| match s.next_fire_time {
                Some(t) => t <= now && !s.is_locked(now),
                None => false,
            })
            .map(|s| (s.next_fire_time.unwrap(), s.id.clone()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        due.truncate(limit);

        let mut acquired = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(schedule) = state.schedules.get_mut(&id) {
                schedule.acquired_by = Some(scheduler_id.to_owned());
                schedule.acquired_until = Some(until);
                acquired.push(schedule.clone());
            }
        }

        Ok(acquired)
    }

    async fn release_schedules(&self, scheduler_id: &str, schedules: Vec<Schedule>) -> CoreResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for schedule in schedules {
                let Some(existing) = state.schedules.get(&schedule.id) else {
                    continue;
                };
                if existing.acquired_by.as_deref() != Some(scheduler_id) {
                    // Lease expired and was stolen by someone else; skip silently.
                    continue;
                }

                if schedule.is_terminal() {
                    state.schedules.remove(&schedule.id);
                    events.push(Event::schedule_removed(schedule.id));
                } else {
                    let id = schedule.id.clone();
                    let mut updated = schedule;
                    updated.acquired_by = None;
                    updated.acquired_until = None;
                    state.schedules.insert(id.clone(), updated);
                    events.push(Event::schedule_updated(id));
                }
            }
        }

        for event in events {
            self.hub.publish(event).await;
        }
        Ok(())
    }

    async fn add_job(&self, job: Job) -> CoreResult<()> {
        let event = {
            let mut state = self.state.lock();
            let id = job.id;
            let task_id = job.task_id.0.clone();
            state.jobs.insert(id, job);
            Event::job_added(id, task_id)
        };
        self.hub.publish(event).await;
        Ok(())
    }

    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> CoreResult<Vec<Job>> {
        let state = self.state.lock();
        let jobs = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.jobs.get(id).cloned())
                .collect(),
            None => state.jobs.values().cloned().collect(),
        };
        Ok(jobs)
    }

    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> CoreResult<Vec<Job>> {
        let now = self.clock.now();
        let until = now + self.lock_expiration_delay;

        let mut state = self.state.lock();
        let mut due: Vec<_> = state
            .jobs
            .values()
            .filter(|j| !j.is_locked(now))
            .map(|j| (j.created_at, j.id))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        due.truncate(limit);

        let mut acquired = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.acquired_by = Some(worker_id.to_owned());
                job.acquired_until = Some(until);
                acquired.push(job.clone());
            }
        }

        // Always a list, possibly empty -- never an absent result.
        Ok(acquired)
    }

    async fn release_jobs(&self, worker_id: &str, jobs: &[Job]) -> CoreResult<()> {
        let mut state = self.state.lock();
        for job in jobs {
            if state
                .jobs
                .get(&job.id)
                .is_some_and(|existing| existing.acquired_by.as_deref() == Some(worker_id))
            {
                state.jobs.remove(&job.id);
            }
        }
        Ok(())
    }

    async fn clear(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.schedules.clear();
        state.jobs.clear();
        Ok(())
    }

    fn event_hub(&self) -> &EventHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use orbital_core::trigger::DateTrigger;

    use super::*;

    fn schedule(id: &str, next_fire_time: chrono::DateTime<Utc>) -> Schedule {
        let mut s = Schedule::new(id, "tasks::noop", DateTrigger::new(next_fire_time));
        s.next_fire_time = Some(next_fire_time);
        s
    }

    #[tokio::test]
    async fn acquire_schedules_is_fifo_by_fire_time() {
        let store = MemoryDataStore::default();
        let now = Utc::now();

        store
            .add_schedule(schedule("b", now - Duration::seconds(1)), ConflictPolicy::Exception)
            .await
            .unwrap();
        store
            .add_schedule(schedule("a", now - Duration::seconds(5)), ConflictPolicy::Exception)
            .await
            .unwrap();

        let acquired = store.acquire_schedules("sched-1", 10).await.unwrap();
        let ids: Vec<_> = acquired.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn acquired_schedule_is_not_reacquired_before_lease_expires() {
        let store = MemoryDataStore::new(Duration::seconds(30));
        let now = Utc::now();
        store
            .add_schedule(schedule("s1", now - Duration::seconds(1)), ConflictPolicy::Exception)
            .await
            .unwrap();

        let first = store.acquire_schedules("sched-1", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.acquire_schedules("sched-2", 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn conflict_policy_do_nothing_keeps_original() {
        let store = MemoryDataStore::default();
        let now = Utc::now();
        store
            .add_schedule(schedule("s1", now), ConflictPolicy::Exception)
            .await
            .unwrap();

        let mut replacement = schedule("s1", now + Duration::seconds(60));
        replacement.tags.insert("replacement".into());
        store
            .add_schedule(replacement, ConflictPolicy::DoNothing)
            .await
            .unwrap();

        let stored = store.get_schedules(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].tags.is_empty());
    }

    #[tokio::test]
    async fn conflict_policy_exception_rejects_and_keeps_original() {
        let store = MemoryDataStore::default();
        let now = Utc::now();
        store
            .add_schedule(schedule("s1", now), ConflictPolicy::Exception)
            .await
            .unwrap();

        let err = store
            .add_schedule(schedule("s1", now), ConflictPolicy::Exception)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictingId { id } if id == "s1"));
    }

    #[tokio::test]
    async fn acquire_jobs_always_returns_a_list() {
        let store = MemoryDataStore::default();
        let jobs = store.acquire_jobs("worker-1", 10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn release_jobs_deletes_owned_rows_only() {
        let store = MemoryDataStore::default();
        let job = Job::new("tasks::noop", Utc::now());
        store.add_job(job.clone()).await.unwrap();

        let acquired = store.acquire_jobs("worker-1", 10).await.unwrap();
        assert_eq!(acquired.len(), 1);

        store.release_jobs("worker-2", &acquired).await.unwrap();
        assert_eq!(store.get_jobs(None).await.unwrap().len(), 1);

        store.release_jobs("worker-1", &acquired).await.unwrap();
        assert!(store.get_jobs(None).await.unwrap().is_empty());
    }
}

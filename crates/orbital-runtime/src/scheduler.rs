use std::sync::Arc;

use chrono::Utc;
use orbital_core::{CoalescePolicy, DataStore, Event, EventHub, Job, Schedule, TaskRegistry, Trigger, WakeupFlag};

use crate::Config;

/// Handle used to request a scheduler shutdown from outside its main loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown: WakeupFlag,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        self.shutdown.raise();
    }
}

/// Translates due schedules into jobs.
///
/// Owns its identity, a wakeup latch woken by schedule-added/updated events
/// from the data store, and its own event hub relaying the store's events
/// alongside the scheduler's own lifecycle events.
pub struct Scheduler {
    id: String,
    store: Arc<dyn DataStore>,
    registry: Arc<TaskRegistry>,
    config: Config,
    hub: Arc<EventHub>,
    wakeup: WakeupFlag,
    shutdown: WakeupFlag,
}

impl Scheduler {
    /// Opens the scoped resources this scheduler needs: relays the store's
    /// events through its own hub and subscribes a wakeup handler to
    /// `ScheduleAdded`/`ScheduleUpdated`.
    pub fn new(id: impl Into<String>, store: Arc<dyn DataStore>, registry: Arc<TaskRegistry>, config: Config) -> Self {
        let hub = Arc::new(EventHub::new());
        hub.relay_events_from(store.event_hub());

        let wakeup = WakeupFlag::new();
        let wakeup_for_callback = wakeup.clone();
        store.event_hub().subscribe(
            Some(vec!["ScheduleAdded", "ScheduleUpdated"]),
            move |_event| wakeup_for_callback.raise(),
        );

        Self {
            id: id.into(),
            store,
            registry,
            config,
            hub,
            wakeup,
            shutdown: WakeupFlag::new(),
        }
    }

    pub fn event_hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the main loop to completion; returns once `handle().shutdown()`
    /// has been called and the in-flight cycle has finished.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.hub.publish(Event::scheduler_started()).await;

        let result = self.run_loop().await;

        self.hub
            .publish(Event::scheduler_stopped(result.as_ref().err().map(|e: &anyhow::Error| e.to_string())))
            .await;
        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        while !self.shutdown.is_raised() {
            self.run_cycle().await?;

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = self.wakeup.wait() => {}
                _ = tokio::time::sleep(self.config.max_poll_time) => {}
            }
            self.wakeup.rearm();
        }

        Ok(())
    }

    async fn run_cycle(&mut self) -> anyhow::Result<()> {
        let mut schedules = self
            .store
            .acquire_schedules(&self.id, self.config.scheduler_acquire_limit)
            .await?;
        let now = Utc::now();

        tracing::debug!(scheduler_id = %self.id, count = schedules.len(), "acquired schedules");

        for schedule in &mut schedules {
            self.advance_schedule(schedule, now).await;
        }

        self.store.release_schedules(&self.id, schedules).await?;
        Ok(())
    }

    async fn advance_schedule(&self, schedule: &mut Schedule, now: chrono::DateTime<Utc>) {
        if !self.registry.contains(&schedule.task_id) {
            tracing::warn!(schedule_id = %schedule.id, task_id = %schedule.task_id, "task lookup failed; schedule put on hold");
            schedule.next_fire_time = None;
            return;
        }

        let mut fire_times = vec![schedule
            .next_fire_time
            .expect("acquired schedules always have a due fire time")];

        loop {
            match schedule.trigger.next(now) {
                Some(t) if t <= now => match schedule.coalesce {
                    CoalescePolicy::All => fire_times.push(t),
                    CoalescePolicy::Latest => fire_times[0] = t,
                    CoalescePolicy::Earliest => {}
                },
                next => {
                    schedule.next_fire_time = next;
                    if next.is_none() {
                        tracing::debug!(schedule_id = %schedule.id, "trigger exhausted; schedule is now terminal");
                    }
                    break;
                }
            }
        }

        for fire_time in fire_times {
            schedule.last_fire_time = Some(fire_time);

            let mut job = Job::new(schedule.task_id.clone(), now);
            job.schedule_id = Some(schedule.id.clone());
            job.args = schedule.args.clone();
            job.scheduled_fire_time = Some(fire_time);
            job.start_deadline = schedule.misfire_grace_time.map(|grace| fire_time + grace);
            job.tags = schedule.tags.clone();

            if let Err(error) = self.store.add_job(job).await {
                tracing::error!(schedule_id = %schedule.id, %error, "failed to add job for due schedule");
            }
        }
    }
}

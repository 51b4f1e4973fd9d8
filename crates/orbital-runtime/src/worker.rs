use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use orbital_core::{DataStore, Event, EventHub, Job, TaskRegistry, WakeupFlag};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::Config;

/// Handle used to request a worker shutdown from outside its main loop.
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown: WakeupFlag,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.raise();
    }
}

/// Bounded-concurrency execution of acquired jobs.
///
/// Owns its identity, a pool of in-flight job tasks capped at
/// `config.max_concurrent_jobs`, a wakeup latch woken by job-added events
/// from the data store, and its own event hub.
pub struct Worker {
    id: String,
    store: Arc<dyn DataStore>,
    registry: Arc<TaskRegistry>,
    config: Config,
    hub: Arc<EventHub>,
    wakeup: WakeupFlag,
    shutdown: WakeupFlag,
    running: Arc<Mutex<HashSet<Uuid>>>,
    tasks: JoinSet<()>,
}

impl Worker {
    pub fn new(id: impl Into<String>, store: Arc<dyn DataStore>, registry: Arc<TaskRegistry>, config: Config) -> Self {
        let hub = Arc::new(EventHub::new());
        hub.relay_events_from(store.event_hub());

        let wakeup = WakeupFlag::new();
        let wakeup_for_callback = wakeup.clone();
        store
            .event_hub()
            .subscribe(Some(vec!["JobAdded"]), move |_event| wakeup_for_callback.raise());

        Self {
            id: id.into(),
            store,
            registry,
            config,
            hub,
            wakeup,
            shutdown: WakeupFlag::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
        }
    }

    pub fn event_hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the main loop to completion. On a clean shutdown, waits for every
    /// in-flight job to finish before returning; on an error shutdown, jobs
    /// in flight are aborted rather than waited on.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.hub.publish(Event::worker_started()).await;

        let result = self.run_loop().await;

        if result.is_ok() {
            while self.tasks.join_next().await.is_some() {}
        } else {
            self.tasks.abort_all();
        }

        self.hub
            .publish(Event::worker_stopped(result.as_ref().err().map(|e: &anyhow::Error| e.to_string())))
            .await;
        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        while !self.shutdown.is_raised() {
            self.dispatch_available().await?;

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

    async fn dispatch_available(&mut self) -> anyhow::Result<()> {
        let available = self.config.max_concurrent_jobs.saturating_sub(self.running.lock().len());
        if available == 0 {
            return Ok(());
        }

        let jobs = self.store.acquire_jobs(&self.id, available).await?;
        tracing::debug!(worker_id = %self.id, count = jobs.len(), "acquired jobs");

        for job in jobs {
            self.running.lock().insert(job.id);

            let store = self.store.clone();
            let registry = self.registry.clone();
            let hub = self.hub.clone();
            let worker_id = self.id.clone();
            let running = self.running.clone();

            self.tasks
                .spawn(async move { run_job(job, store, registry, hub, worker_id, running).await });
        }

        Ok(())
    }
}

/// Executes a single acquired job and guarantees its lock is released and its
/// id removed from the running set afterwards, however it finishes.
async fn run_job(
    job: Job,
    store: Arc<dyn DataStore>,
    registry: Arc<TaskRegistry>,
    hub: Arc<EventHub>,
    worker_id: String,
    running: Arc<Mutex<HashSet<Uuid>>>,
) {
    let start_time = Utc::now();

    if job.deadline_missed(start_time) {
        tracing::warn!(job_id = %job.id, task_id = %job.task_id, "start deadline missed; job will not run");
        hub.publish(Event::job_deadline_missed(job.id, job.task_id.0.clone())).await;
    } else {
        hub.publish(Event::job_started(job.id, job.task_id.0.clone())).await;

        let task = registry.get(&job.task_id);
        let outcome = match task {
            Ok(task) => std::panic::AssertUnwindSafe(task.call(&job.args)).catch_unwind().await,
            Err(error) => Ok(Err(error)),
        };

        match outcome {
            Ok(Ok(value)) => {
                hub.publish(Event::job_completed(job.id, job.task_id.0.clone(), value)).await;
            }
            Ok(Err(error)) => {
                tracing::warn!(job_id = %job.id, %error, "job failed");
                let traceback = format_error_chain(&error);
                hub.publish(Event::job_failed(job.id, job.task_id.0.clone(), error.to_string(), traceback))
                    .await;
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_owned());
                tracing::error!(job_id = %job.id, %message, "job task panicked");
                // `catch_unwind` gives us the payload but not the original
                // unwind's backtrace, so the traceback field records only
                // that it was a panic rather than an ordinary task error.
                let traceback = format!("panicked: {message}");
                hub.publish(Event::job_failed(job.id, job.task_id.0.clone(), message, traceback))
                    .await;
            }
        }
    }

    running.lock().remove(&job.id);
    if let Err(error) = store.release_jobs(&worker_id, std::slice::from_ref(&job)).await {
        tracing::error!(job_id = %job.id, %error, "failed to release job after execution");
    }
}

/// Renders an error's full `source()` chain, one cause per line, standing in
/// for a traceback for errors that don't carry one of their own.
fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

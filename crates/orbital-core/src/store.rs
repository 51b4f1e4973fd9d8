use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::hub::{EventHub, SubscriptionToken};
use crate::model::{ConflictPolicy, Job, Schedule};

/// Durable, locked catalog of schedules and jobs.
///
/// Every method here is the atomic, transactional primitive described by the
/// locking protocol: callers never need to wrap a call in their own
/// transaction to get the acquire/stamp/return behavior the Scheduler and
/// Worker main loops depend on.
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// Insert `schedule`, or apply `policy` on a primary-key collision.
    async fn add_schedule(&self, schedule: Schedule, policy: ConflictPolicy) -> CoreResult<()>;

    /// Remove the subset of `ids` whose lock has expired or is absent.
    async fn remove_schedules(&self, ids: &[String]) -> CoreResult<()>;

    /// All schedules, or the intersection with `ids` if given, ordered by id.
    async fn get_schedules(&self, ids: Option<&[String]>) -> CoreResult<Vec<Schedule>>;

    /// Atomically claim up to `limit` due, unlocked schedules.
    async fn acquire_schedules(&self, scheduler_id: &str, limit: usize) -> CoreResult<Vec<Schedule>>;

    /// Persist trigger advancement and release the lock on each schedule
    /// still owned by `scheduler_id`; terminal schedules are deleted instead.
    async fn release_schedules(&self, scheduler_id: &str, schedules: Vec<Schedule>) -> CoreResult<()>;

    /// Insert `job`. Colliding ids are an implementation error, not a policy
    /// decision: job ids are unique 128-bit values minted by the caller.
    async fn add_job(&self, job: Job) -> CoreResult<()>;

    /// All jobs, or the intersection with `ids` if given.
    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> CoreResult<Vec<Job>>;

    /// Atomically claim up to `limit` unlocked jobs, oldest first.
    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> CoreResult<Vec<Job>>;

    /// Delete the rows in `jobs` still owned by `worker_id`.
    async fn release_jobs(&self, worker_id: &str, jobs: &[Job]) -> CoreResult<()>;

    /// Remove every schedule and job. Intended for tests and fresh starts.
    async fn clear(&self) -> CoreResult<()>;

    /// The embedded event hub schedule/job mutations are published through.
    fn event_hub(&self) -> &EventHub;

    fn subscribe<F>(&self, kinds: Option<Vec<&'static str>>, callback: F) -> SubscriptionToken
    where
        F: Fn(&crate::event::Event) + Send + Sync + 'static,
        Self: Sized,
    {
        self.event_hub().subscribe(kinds, callback)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.event_hub().unsubscribe(token);
    }
}

/// Current time, injected so tests can drive lease expiry deterministically
/// instead of sleeping on the wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

use std::time::Duration;

/// Tunables shared by [`crate::scheduler::Scheduler`] and [`crate::worker::Worker`].
///
/// Carries no environment/file parsing of its own; the binary entry point is
/// responsible for layering command-line arguments over these defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long an acquired row may be held before another instance is
    /// allowed to re-acquire it.
    pub lock_expiration_delay: Duration,

    /// How long the main loop sleeps between cycles when nothing wakes it
    /// early, bounding how long a back end without push notifications can
    /// leave a due schedule or job unnoticed.
    pub max_poll_time: Duration,

    /// The `limit` passed to `acquire_schedules` each scheduler cycle.
    pub scheduler_acquire_limit: usize,

    /// The Worker's concurrency cap.
    pub max_concurrent_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_expiration_delay: Duration::from_secs(30),
            max_poll_time: Duration::from_secs(1),
            scheduler_acquire_limit: 100,
            max_concurrent_jobs: num_cpus::get().max(1),
        }
    }
}

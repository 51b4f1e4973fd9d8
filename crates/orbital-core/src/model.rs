use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::TriggerState;

/// Handle to a registered callable, keyed by the same stable string used as
/// [`Schedule::task_id`] / [`Job::task_id`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Policy applied when a schedule's trigger has multiple past-due fire times
/// at the moment a scheduler acquires it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Keep only the earliest past-due fire time; discard the rest.
    Earliest,
    /// Keep only the most recent past-due fire time; discard the rest.
    Latest,
    /// Emit one job per past-due fire time.
    All,
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        Self::Earliest
    }
}

/// Policy applied when `add_schedule` collides with an existing id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the existing row; the new one is silently discarded.
    DoNothing,
    /// Overwrite the existing row.
    Replace,
    /// Fail with [`crate::error::CoreError::ConflictingId`].
    Exception,
}

/// Positional and keyword arguments bound to a task invocation.
///
/// Kept as raw JSON values rather than a generic `T` so that the data store
/// and event hub do not need to be generic over the argument type: the task
/// registry on the worker side is responsible for deserializing them into
/// the concrete types its callable expects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub positional: Vec<serde_json::Value>,
    pub keyword: serde_json::Map<String, serde_json::Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: Vec<serde_json::Value>) -> Self {
        Self {
            positional: values,
            keyword: Default::default(),
        }
    }
}

/// A task + trigger + policy record that produces a sequence of jobs.
///
/// `trigger` is opaque from the data store's point of view: its state lives
/// entirely inside the serialized row, the structured columns here exist
/// only so that back ends can index and order on them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub task_id: TaskId,
    pub trigger: TriggerState,
    pub args: Args,
    pub coalesce: CoalescePolicy,
    pub misfire_grace_time: Option<chrono::Duration>,
    pub tags: BTreeSet<String>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fire_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub acquired_by: Option<String>,
    #[serde(default)]
    pub acquired_until: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(
        id: impl Into<String>,
        task_id: impl Into<TaskId>,
        trigger: impl Into<TriggerState>,
    ) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            trigger: trigger.into(),
            args: Args::new(),
            coalesce: CoalescePolicy::default(),
            misfire_grace_time: None,
            tags: BTreeSet::new(),
            next_fire_time: None,
            last_fire_time: None,
            acquired_by: None,
            acquired_until: None,
        }
    }

    /// A schedule with no further fire time is terminal and eligible for
    /// removal the next time it is released.
    pub fn is_terminal(&self) -> bool {
        self.next_fire_time.is_none()
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.acquired_until, Some(until) if until > now)
    }
}

/// A single scheduled invocation waiting to be executed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: TaskId,
    pub schedule_id: Option<String>,
    pub args: Args,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub start_deadline: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub acquired_by: Option<String>,
    #[serde(default)]
    pub acquired_until: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(task_id: impl Into<TaskId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            schedule_id: None,
            args: Args::new(),
            scheduled_fire_time: None,
            start_deadline: None,
            tags: BTreeSet::new(),
            created_at,
            acquired_by: None,
            acquired_until: None,
        }
    }

    /// Whether the job was picked up too late to honor its misfire grace time.
    pub fn deadline_missed(&self, start_time: DateTime<Utc>) -> bool {
        matches!(self.start_deadline, Some(deadline) if start_time > deadline)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.acquired_until, Some(until) if until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_terminal_when_next_fire_time_is_none() {
        let trigger = crate::trigger::DateTrigger::new(Utc::now());
        let mut s = Schedule::new("s1", "tasks::noop", trigger);
        assert!(s.is_terminal());
        s.next_fire_time = Some(Utc::now());
        assert!(!s.is_terminal());
    }

    #[test]
    fn job_deadline_missed_only_when_past_deadline() {
        let now = Utc::now();
        let mut job = Job::new("tasks::noop", now);
        assert!(!job.deadline_missed(now));

        job.start_deadline = Some(now - chrono::Duration::seconds(1));
        assert!(job.deadline_missed(now));
    }
}

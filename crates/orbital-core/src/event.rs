use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! event_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $variant:ident { $( $field:ident : $ty:ty ),* $(,)? } ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        pub enum $name {
            $( $variant { timestamp: DateTime<Utc>, $( $field: $ty ),* } ),*
        }

        impl $name {
            /// The UTC instant this event was constructed at.
            pub fn timestamp(&self) -> DateTime<Utc> {
                match self {
                    $( Self::$variant { timestamp, .. } => *timestamp ),*
                }
            }

            /// Stable name of this event's variant, used for type-filtered subscriptions.
            pub fn kind(&self) -> &'static str {
                match self {
                    $( Self::$variant { .. } => stringify!($variant) ),*
                }
            }
        }
    };
}

event_enum! {
    /// Every event the core publishes.
    ///
    /// Events are immutable once constructed; `timestamp` is stamped at
    /// construction and is never mutated afterwards.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub enum Event {
        ScheduleAdded { schedule_id: String },
        ScheduleUpdated { schedule_id: String },
        ScheduleRemoved { schedule_id: String },
        ScheduleDeserializationFailed { schedule_id: String, error: String },

        JobAdded { job_id: Uuid, task_id: String },
        JobRemoved { job_id: Uuid },
        JobDeserializationFailed { job_id: Uuid, error: String },

        SchedulerStarted {},
        SchedulerStopped { error: Option<String> },

        WorkerStarted {},
        WorkerStopped { error: Option<String> },

        JobStarted { job_id: Uuid, task_id: String },
        JobDeadlineMissed { job_id: Uuid, task_id: String },
        JobCompleted { job_id: Uuid, task_id: String, return_value: serde_json::Value },
        JobFailed { job_id: Uuid, task_id: String, exception: String, traceback: String },
    }
}

impl Event {
    fn with_timestamp<F>(build: F) -> Self
    where
        F: FnOnce(DateTime<Utc>) -> Self,
    {
        build(Utc::now())
    }

    pub fn schedule_added(schedule_id: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::ScheduleAdded {
            timestamp,
            schedule_id: schedule_id.into(),
        })
    }

    pub fn schedule_updated(schedule_id: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::ScheduleUpdated {
            timestamp,
            schedule_id: schedule_id.into(),
        })
    }

    pub fn schedule_removed(schedule_id: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::ScheduleRemoved {
            timestamp,
            schedule_id: schedule_id.into(),
        })
    }

    pub fn schedule_deserialization_failed(
        schedule_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_timestamp(|timestamp| Self::ScheduleDeserializationFailed {
            timestamp,
            schedule_id: schedule_id.into(),
            error: error.into(),
        })
    }

    pub fn job_added(job_id: Uuid, task_id: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::JobAdded {
            timestamp,
            job_id,
            task_id: task_id.into(),
        })
    }

    pub fn job_removed(job_id: Uuid) -> Self {
        Self::with_timestamp(|timestamp| Self::JobRemoved { timestamp, job_id })
    }

    pub fn job_deserialization_failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::JobDeserializationFailed {
            timestamp,
            job_id,
            error: error.into(),
        })
    }

    pub fn scheduler_started() -> Self {
        Self::with_timestamp(|timestamp| Self::SchedulerStarted { timestamp })
    }

    pub fn scheduler_stopped(error: Option<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::SchedulerStopped { timestamp, error })
    }

    pub fn worker_started() -> Self {
        Self::with_timestamp(|timestamp| Self::WorkerStarted { timestamp })
    }

    pub fn worker_stopped(error: Option<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::WorkerStopped { timestamp, error })
    }

    pub fn job_started(job_id: Uuid, task_id: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::JobStarted {
            timestamp,
            job_id,
            task_id: task_id.into(),
        })
    }

    pub fn job_deadline_missed(job_id: Uuid, task_id: impl Into<String>) -> Self {
        Self::with_timestamp(|timestamp| Self::JobDeadlineMissed {
            timestamp,
            job_id,
            task_id: task_id.into(),
        })
    }

    pub fn job_completed(
        job_id: Uuid,
        task_id: impl Into<String>,
        return_value: serde_json::Value,
    ) -> Self {
        Self::with_timestamp(|timestamp| Self::JobCompleted {
            timestamp,
            job_id,
            task_id: task_id.into(),
            return_value,
        })
    }

    pub fn job_failed(
        job_id: Uuid,
        task_id: impl Into<String>,
        exception: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self::with_timestamp(|timestamp| Self::JobFailed {
            timestamp,
            job_id,
            task_id: task_id.into(),
            exception: exception.into(),
            traceback: traceback.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant_name() {
        let event = Event::schedule_added("s1");
        assert_eq!(event.kind(), "ScheduleAdded");
    }
}

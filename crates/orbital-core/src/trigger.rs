use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A stateful generator of future firing times.
///
/// Implementations must return a non-decreasing sequence from successive
/// calls and signal exhaustion with `None`. Trigger state is whatever the
/// implementation needs to compute the next value; it is captured as part of
/// the owning [`crate::model::Schedule`]'s serialized form, not tracked
/// separately by the data store.
pub trait Trigger: std::fmt::Debug {
    fn next(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Fires once every `period`, starting at `anchor`, optionally stopping at
/// `end_time`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntervalTrigger {
    anchor: DateTime<Utc>,
    period: Duration,
    end_time: Option<DateTime<Utc>>,
    /// Number of fires already produced; `None` until the first call.
    count: u64,
}

impl IntervalTrigger {
    pub fn new(anchor: DateTime<Utc>, period: Duration) -> Self {
        assert!(period > Duration::zero(), "trigger period must be positive");
        Self {
            anchor,
            period,
            end_time: None,
            count: 0,
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }
}

impl Trigger for IntervalTrigger {
    fn next(&mut self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let candidate = self.anchor + self.period * self.count as i32;

        if let Some(end_time) = self.end_time {
            if candidate > end_time {
                return None;
            }
        }

        self.count += 1;
        Some(candidate)
    }
}

/// Fires exactly once at `fire_time`, then exhausts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DateTrigger {
    fire_time: Option<DateTime<Utc>>,
}

impl DateTrigger {
    pub fn new(fire_time: DateTime<Utc>) -> Self {
        Self {
            fire_time: Some(fire_time),
        }
    }
}

impl Trigger for DateTrigger {
    fn next(&mut self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.fire_time.take()
    }
}

/// The closed set of trigger kinds the core knows how to (de)serialize as
/// part of a schedule. Implementers who need a different trigger (e.g. a
/// cron expression) add a variant here and an arm below; the rest of the
/// core only ever calls through the [`Trigger`] contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerState {
    Interval(IntervalTrigger),
    Date(DateTrigger),
}

impl Trigger for TriggerState {
    fn next(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(t) => t.next(now),
            Self::Date(t) => t.next(now),
        }
    }
}

impl From<IntervalTrigger> for TriggerState {
    fn from(t: IntervalTrigger) -> Self {
        Self::Interval(t)
    }
}

impl From<DateTrigger> for TriggerState {
    fn from(t: DateTrigger) -> Self {
        Self::Date(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_trigger_produces_non_decreasing_sequence() {
        let anchor = Utc::now();
        let mut trigger = IntervalTrigger::new(anchor, Duration::seconds(10));

        let first = trigger.next(anchor).unwrap();
        let second = trigger.next(anchor).unwrap();
        assert!(second > first);
        assert_eq!(second - first, Duration::seconds(10));
    }

    #[test]
    fn interval_trigger_exhausts_past_end_time() {
        let anchor = Utc::now();
        let mut trigger =
            IntervalTrigger::new(anchor, Duration::seconds(10)).with_end_time(anchor);

        assert!(trigger.next(anchor).is_some());
        assert!(trigger.next(anchor).is_none());
    }

    #[test]
    fn date_trigger_fires_once() {
        let fire_time = Utc::now();
        let mut trigger = DateTrigger::new(fire_time);

        assert_eq!(trigger.next(fire_time), Some(fire_time));
        assert_eq!(trigger.next(fire_time), None);
    }
}

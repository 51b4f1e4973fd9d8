use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

/// Bytes ↔ JSON value codec for anything the data store needs to persist as
/// an opaque blob (a [`crate::model::Schedule`] or [`crate::model::Job`]).
///
/// The trait itself is kept to non-generic, object-safe methods so back ends
/// can hold it as `Arc<dyn Serializer>`; callers that want to round-trip a
/// concrete type go through [`serialize`]/[`deserialize`] below, which layer
/// `T: Serialize`/`DeserializeOwned` on top via an intermediate
/// [`serde_json::Value`].
///
/// Implementations must be deterministic and round-trip: for any value `x`,
/// `deserialize_value(&serialize_value(x)?)? == x` is expected to hold
/// (structural equality, not byte-for-byte equality of re-encoding).
pub trait Serializer: Send + Sync {
    fn serialize_value(&self, value: serde_json::Value) -> CoreResult<Vec<u8>>;
    fn deserialize_value(&self, bytes: &[u8]) -> CoreResult<serde_json::Value>;
}

/// Round-trips `value` through `serializer`, going by way of
/// [`serde_json::Value`] so the trait itself can stay object-safe.
pub fn serialize<T: Serialize>(serializer: &dyn Serializer, value: &T) -> CoreResult<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| CoreError::Serialization {
        what: std::any::type_name::<T>(),
        source: Box::new(e),
    })?;
    serializer.serialize_value(value)
}

/// Decodes a `T` out of `bytes` via `serializer`.
pub fn deserialize<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> CoreResult<T> {
    let value = serializer.deserialize_value(bytes)?;
    serde_json::from_value(value).map_err(|e| CoreError::Deserialization {
        what: std::any::type_name::<T>(),
        source: Box::new(e),
    })
}

/// Default serializer, backed by JSON.
///
/// This is the general object-graph codec every back end falls back to
/// unless the embedding application supplies a binary codec of its own; the
/// trait above is kept minimal so that swap is a one-line change at the call
/// site, not a Data Store API change.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_value(&self, value: serde_json::Value) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(&value).map_err(|e| CoreError::Serialization {
            what: "serde_json::Value",
            source: Box::new(e),
        })
    }

    fn deserialize_value(&self, bytes: &[u8]) -> CoreResult<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Deserialization {
            what: "serde_json::Value",
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Schedule;
    use crate::trigger::DateTrigger;

    #[test]
    fn json_serializer_round_trips_a_schedule() {
        let codec = JsonSerializer;
        let trigger = DateTrigger::new(chrono::Utc::now());
        let schedule = Schedule::new("s1", "tasks::noop", trigger);

        let bytes = serialize(&codec, &schedule).unwrap();
        let decoded: Schedule = deserialize(&codec, &bytes).unwrap();

        assert_eq!(decoded.id, schedule.id);
        assert_eq!(decoded.task_id, schedule.task_id);
    }

    #[test]
    fn deserialize_failure_is_surfaced_as_deserialization_error() {
        let codec = JsonSerializer;
        let result: CoreResult<Schedule> = deserialize(&codec, b"not json");
        assert!(matches!(result, Err(CoreError::Deserialization { .. })));
    }
}

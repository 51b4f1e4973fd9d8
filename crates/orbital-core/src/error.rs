use thiserror::Error;

/// Error taxonomy shared by every data store back end and by the serializer
/// contract. Loop-level and startup failures are not represented here: those
/// are propagated as `anyhow::Error` by `orbital-runtime` and terminate the
/// owning component.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schedule {id:?} already exists")]
    ConflictingId { id: String },

    #[error("failed to serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to deserialize {what}: {source}")]
    Deserialization {
        what: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("no task registered under id {0:?}")]
    TaskNotFound(String),

    #[error("back end does not support timezone-aware timestamps")]
    NaiveTimestampsUnsupported,

    #[error("data store error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type CoreResult<T> = Result<T, CoreError>;

//! Errors surfaced by the conversion service to its callers.

use std::time::Duration;

use thiserror::Error;

use crate::converter::ConversionError;
use crate::queue::QueueError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing or empty upload, unsafe filename, unsupported type. Raised
    /// before storage or the queue are touched.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("conversion timed out after {}s", .0.as_secs_f32())]
    EngineTimeout(Duration),

    #[error("conversion failed: {0}")]
    EngineFailure(String),

    /// The job was not enqueued; the caller must not assume it will run.
    #[error("job could not be queued: {0}")]
    QueuePublish(#[source] QueueError),

    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InputInvalid(_) => "input_invalid",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::EngineTimeout(_) => "engine_timeout",
            ServiceError::EngineFailure(_) => "engine_failure",
            ServiceError::QueuePublish(_) => "queue_publish_failure",
            ServiceError::Storage(_) => "storage",
            ServiceError::Internal(_) => "internal",
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidName { .. } => ServiceError::InputInvalid(e.to_string()),
            StorageError::AlreadyExists(_) => ServiceError::Conflict(e.to_string()),
            StorageError::Io { .. } => ServiceError::Storage(e),
        }
    }
}

impl From<ConversionError> for ServiceError {
    fn from(e: ConversionError) -> Self {
        match e {
            ConversionError::InputMissing { .. } => ServiceError::NotFound(e.to_string()),
            ConversionError::Timeout { timeout } => ServiceError::EngineTimeout(timeout),
            ConversionError::EngineFailure(detail) => ServiceError::EngineFailure(detail),
            ConversionError::Storage(inner) => inner.into(),
            ConversionError::Io(inner) => ServiceError::Internal(inner.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SafeName;

    #[test]
    fn test_unsafe_name_maps_to_input_invalid() {
        let err: ServiceError = SafeName::parse("../x.xlsx").unwrap_err().into();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[test]
    fn test_conversion_errors_map_to_engine_kinds() {
        let timeout: ServiceError = ConversionError::Timeout {
            timeout: Duration::from_secs(60),
        }
        .into();
        assert_eq!(timeout.kind(), "engine_timeout");
        assert_eq!(timeout.to_string(), "conversion timed out after 60s");

        let failure: ServiceError = ConversionError::EngineFailure("exit status 1".into()).into();
        assert_eq!(failure.kind(), "engine_failure");
    }

    #[test]
    fn test_queue_failure_is_its_own_kind() {
        let err = ServiceError::QueuePublish(QueueError::Closed);
        assert_eq!(err.kind(), "queue_publish_failure");
        assert_eq!(err.to_string(), "job could not be queued: queue closed");
    }
}

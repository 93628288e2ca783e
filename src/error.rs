//! Error types for the workflow engine
//!
//! Two layers of errors exist:
//!
//! - [`ExecutorError`]: raised by a single handler invocation. The engine
//!   catches it per dispatch and records it as an `ExecutorFailed` event.
//! - [`WorkflowError`]: raised by the engine itself (configuration problems,
//!   bad caller input, checkpoint failures, cancellation).
//!
//! Both are `Clone` so failures can live inside the replayable event log and
//! be surfaced again from [`Run::outcome`](crate::execution::Run::outcome).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::executor::ExecutorId;
use crate::workflow::graph::WorkflowBuildError;
use crate::workflow::message::MessageType;

/// Convenience alias used throughout the crate
pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

/// Error raised while an executor handles a message
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// Handler reported a failure
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Handler exceeded the configured executor timeout
    #[error("Executor timed out after {0:?}")]
    Timeout(Duration),

    /// Handler observed cancellation of the run
    #[error("Executor cancelled")]
    Cancelled,

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Handler issued an external request that does not fit its port
    #[error("Invalid external request: {0}")]
    InvalidRequest(String),

    /// Handler task panicked
    #[error("Executor panicked: {0}")]
    Panicked(String),
}

impl ExecutorError {
    /// Create a failure with a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure wrapping an underlying error
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Whether the retry policy may re-run the handler
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutorError::Cancelled | ExecutorError::InvalidRequest(_))
    }

    /// Check if the error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutorError::Timeout(_))
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors produced by the workflow engine and its run handle
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// Workflow graph failed validation
    #[error("Workflow build error: {0}")]
    Build(#[from] WorkflowBuildError),

    /// An executor factory returned an instance with the wrong id
    #[error("Executor id mismatch: registration {expected}, instance {actual}")]
    ExecutorIdMismatch {
        expected: ExecutorId,
        actual: ExecutorId,
    },

    /// An executor factory failed
    #[error("Failed to instantiate executor {executor_id}: {source}")]
    Instantiation {
        executor_id: ExecutorId,
        #[source]
        source: ExecutorError,
    },

    /// Referenced executor is not part of the workflow or run
    #[error("Unknown executor: {0}")]
    UnknownExecutor(ExecutorId),

    /// Message type not accepted by the receiving executor
    #[error("Executor {executor_id} cannot handle messages of type {message_type}")]
    InputTypeMismatch {
        executor_id: ExecutorId,
        message_type: MessageType,
    },

    /// Response supplied for a request that is not pending
    #[error("No pending request with id {0}")]
    UnknownRequest(String),

    /// Response payload does not match the port's response type
    #[error("Response to request {request_id} has type {actual}, expected {expected}")]
    ResponseTypeMismatch {
        request_id: String,
        expected: MessageType,
        actual: MessageType,
    },

    /// A single executor failure, surfaced to the run's caller
    #[error("Executor {executor_id} failed: {source}")]
    ExecutorFailed {
        executor_id: ExecutorId,
        #[source]
        source: Arc<ExecutorError>,
    },

    /// More than one executor failed during the run
    #[error("{} executors failed", .0.len())]
    Aggregate(Vec<WorkflowError>),

    /// Maximum supersteps exceeded
    #[error("Max supersteps exceeded: {0}")]
    MaxSuperstepsExceeded(usize),

    /// A drive of the run took longer than the configured run timeout
    #[error("Run timeout after {0:?}")]
    RunTimeout(Duration),

    /// Run was cancelled through its cancellation token
    #[error("Run cancelled")]
    Cancelled,

    /// Operation not allowed in the run's current status
    #[error("Invalid run state: {0}")]
    InvalidRunState(String),

    /// Error in checkpointing
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint belongs to another workflow
    #[error("Checkpoint workflow mismatch: expected {expected}, found {found}")]
    CheckpointMismatch { expected: String, found: String },

    /// Checkpoint written by a newer format version
    #[error("Unsupported checkpoint version {0}")]
    UnsupportedCheckpointVersion(u32),

    /// Message (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkflowError {
    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a checkpoint mismatch error
    pub fn checkpoint_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::CheckpointMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an executor failure error
    pub fn executor_failed(executor_id: impl Into<ExecutorId>, source: Arc<ExecutorError>) -> Self {
        Self::ExecutorFailed {
            executor_id: executor_id.into(),
            source,
        }
    }

    /// Check if this error reports executor failures
    pub fn is_executor_failure(&self) -> bool {
        matches!(
            self,
            WorkflowError::ExecutorFailed { .. } | WorkflowError::Aggregate(_)
        )
    }

    /// Check if this is a configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WorkflowError::Build(_)
                | WorkflowError::ExecutorIdMismatch { .. }
                | WorkflowError::Instantiation { .. }
                | WorkflowError::Config(_)
        )
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    static_assertions::assert_impl_all!(super::WorkflowError: Send, Sync, Clone);
    static_assertions::assert_impl_all!(super::ExecutorError: Send, Sync, Clone);
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkflowError::MaxSuperstepsExceeded(100);
        assert_eq!(format!("{}", err), "Max supersteps exceeded: 100");
    }

    #[test]
    fn test_executor_error_with_source() {
        let io = std::io::Error::other("disk full");
        let err = ExecutorError::with_source("write failed", io);
        assert_eq!(err.to_string(), "write failed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_retryable() {
        assert!(ExecutorError::msg("boom").is_retryable());
        assert!(ExecutorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ExecutorError::Cancelled.is_retryable());
        assert!(!ExecutorError::InvalidRequest("x".into()).is_retryable());
    }

    #[test]
    fn test_aggregate_display() {
        let a = WorkflowError::executor_failed("a", Arc::new(ExecutorError::msg("x")));
        let b = WorkflowError::executor_failed("b", Arc::new(ExecutorError::msg("y")));
        let err = WorkflowError::Aggregate(vec![a, b]);
        assert_eq!(err.to_string(), "2 executors failed");
        assert!(err.is_executor_failure());
    }

    #[test]
    fn test_configuration_classification() {
        let err = WorkflowError::ExecutorIdMismatch {
            expected: ExecutorId::new("a"),
            actual: ExecutorId::new("b"),
        };
        assert!(err.is_configuration());
        assert!(!WorkflowError::Cancelled.is_configuration());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: ExecutorError = parse.into();
        assert!(matches!(err, ExecutorError::Serialization(_)));
    }
}

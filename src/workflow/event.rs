//! Workflow events
//!
//! Events are appended to a run's event log in superstep order and never
//! change after emission.

use std::sync::Arc;

use serde_json::Value;

use super::executor::ExecutorId;
use super::message::Message;
use super::port::ExternalRequest;
use crate::error::ExecutorError;

/// An event emitted while a run is driven
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Executor started handling a message
    ExecutorInvoked {
        executor_id: ExecutorId,
        superstep: usize,
    },

    /// Executor finished handling a message
    ExecutorCompleted {
        executor_id: ExecutorId,
        superstep: usize,
    },

    /// Executor failed to handle a message; its effects were discarded
    ExecutorFailed {
        executor_id: ExecutorId,
        superstep: usize,
        error: Arc<ExecutorError>,
    },

    /// Executor is waiting for external input
    RequestInfo(ExternalRequest),

    /// Output executor yielded a value
    WorkflowOutput { source: ExecutorId, data: Message },

    /// Application-defined event
    Custom {
        executor_id: ExecutorId,
        name: String,
        data: Value,
    },
}

impl WorkflowEvent {
    /// Executor the event originates from
    pub fn executor_id(&self) -> &ExecutorId {
        match self {
            WorkflowEvent::ExecutorInvoked { executor_id, .. }
            | WorkflowEvent::ExecutorCompleted { executor_id, .. }
            | WorkflowEvent::ExecutorFailed { executor_id, .. }
            | WorkflowEvent::Custom { executor_id, .. } => executor_id,
            WorkflowEvent::RequestInfo(request) => &request.source,
            WorkflowEvent::WorkflowOutput { source, .. } => source,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, WorkflowEvent::ExecutorFailed { .. })
    }

    /// Short name of the variant, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::ExecutorInvoked { .. } => "executor_invoked",
            WorkflowEvent::ExecutorCompleted { .. } => "executor_completed",
            WorkflowEvent::ExecutorFailed { .. } => "executor_failed",
            WorkflowEvent::RequestInfo(_) => "request_info",
            WorkflowEvent::WorkflowOutput { .. } => "workflow_output",
            WorkflowEvent::Custom { .. } => "custom",
        }
    }
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowEvent::ExecutorInvoked { executor_id, superstep } => {
                write!(f, "[{}] invoked {}", superstep, executor_id)
            }
            WorkflowEvent::ExecutorCompleted { executor_id, superstep } => {
                write!(f, "[{}] completed {}", superstep, executor_id)
            }
            WorkflowEvent::ExecutorFailed {
                executor_id,
                superstep,
                error,
            } => write!(f, "[{}] failed {}: {}", superstep, executor_id, error),
            WorkflowEvent::RequestInfo(request) => write!(
                f,
                "request {} on port {} from {}",
                request.request_id,
                request.port.id(),
                request.source
            ),
            WorkflowEvent::WorkflowOutput { source, data } => {
                write!(f, "output from {}: {}", source, data.payload())
            }
            WorkflowEvent::Custom {
                executor_id,
                name,
                data,
            } => write!(f, "{} from {}: {}", name, executor_id, data),
        }
    }
}

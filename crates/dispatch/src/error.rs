//! Error taxonomy for the dispatch engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskId;

/// Errors surfaced to callers of the engine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// Ack deadline exceeded on every attempt
    #[error("task {task_id} timed out after {attempts} attempt(s)")]
    TaskTimeout { task_id: TaskId, attempts: u32 },

    /// Admission control refused the submission
    #[error("task rejected: {reason}")]
    TaskRejected { reason: String },

    /// The task body failed and will not be retried
    #[error("task {task_id} failed: {error}")]
    TaskFailed { task_id: TaskId, error: TaskError },

    /// Worker terminated while holding an envelope. Internal only: the
    /// protocol turns this into a retry or a timeout.
    #[error("worker {0} crashed")]
    WorkerCrashed(String),

    /// Dependency short-circuited by an open breaker
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// Task dispatched after its hard deadline and dropped
    #[error("task {0} missed its deadline")]
    DeadlineMissed(TaskId),

    /// Task was cancelled before it produced a result
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// No worker could be spawned and none is live
    #[error("worker pool unavailable: {0}")]
    PoolUnavailable(String),

    /// No handler registered for the task kind
    #[error("no handler registered for task kind '{0}'")]
    UnknownTaskKind(String),

    /// Engine configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine has not been started
    #[error("engine is not running")]
    NotRunning,

    /// Engine was already started
    #[error("engine is already running")]
    AlreadyRunning,

    /// Engine stopped before the task resolved
    #[error("engine stopped")]
    EngineStopped,

    /// Graceful shutdown did not finish in time
    #[error("shutdown timed out")]
    ShutdownTimeout,
}

impl DispatchError {
    /// Create a rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::TaskRejected {
            reason: reason.into(),
        }
    }

    /// Whether this is an admission-control rejection (`Busy`)
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::TaskRejected { .. })
    }
}

/// Error kind reported when a hard deadline drops a task
pub const DEADLINE_MISSED: &str = "deadline_missed";

/// Error kind reported when the pool cannot run a queued task
pub const POOL_UNAVAILABLE: &str = "pool_unavailable";

/// Error kind reported when input does not match a typed task body
pub const INVALID_INPUT: &str = "invalid_input";

/// Error kind reported when a breaker short-circuits a call
pub const CIRCUIT_OPEN: &str = "circuit_open";

/// Error returned by a task body
///
/// Classified errors let the delivery protocol decide between retrying and
/// surfacing a failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{message}")]
pub struct TaskError {
    /// Human-readable error message
    pub message: String,

    /// Error kind used for classification and retry filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl TaskError {
    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: true,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: false,
        }
    }

    /// Set the error kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Error kind, if classified
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::non_retryable(err.to_string()).with_kind(INVALID_INPUT)
    }
}

impl From<crate::reliability::CircuitBreakerError> for TaskError {
    fn from(err: crate::reliability::CircuitBreakerError) -> Self {
        TaskError::retryable(err.to_string()).with_kind(CIRCUIT_OPEN)
    }
}

impl From<crate::reliability::CircuitCallError<TaskError>> for TaskError {
    fn from(err: crate::reliability::CircuitCallError<TaskError>) -> Self {
        match err {
            crate::reliability::CircuitCallError::Rejected(open) => open.into(),
            crate::reliability::CircuitCallError::Failed(err) => err,
        }
    }
}

impl From<crate::task::AckError> for TaskError {
    fn from(err: crate::task::AckError) -> Self {
        match err {
            crate::task::AckError::Cancelled => TaskError::non_retryable(err.to_string()),
            crate::task::AckError::ChannelClosed => TaskError::retryable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_classification() {
        let err = TaskError::retryable("upstream flaked").with_kind("io");
        assert!(err.retryable);
        assert_eq!(err.kind(), Some("io"));

        let err = TaskError::non_retryable("bad input");
        assert!(!err.retryable);
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn test_json_error_is_not_retryable() {
        let err: TaskError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(!err.retryable);
        assert_eq!(err.kind(), Some(INVALID_INPUT));
    }

    #[test]
    fn test_dispatch_error_display() {
        let err = DispatchError::TaskTimeout {
            task_id: TaskId::from("t-1"),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "task t-1 timed out after 3 attempt(s)");
        assert!(DispatchError::rejected("busy").is_rejected());
    }
}

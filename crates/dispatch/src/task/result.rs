//! Task outcomes as delivered to callers

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TaskId;
use crate::error::{DispatchError, TaskError, DEADLINE_MISSED, POOL_UNAVAILABLE};
use crate::pool::WorkerId;
use crate::protocol::Sequence;

/// Terminal status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final result of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub sequence: Sequence,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Worker that produced the outcome, if any ran it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    /// Execution time of the accepted attempt
    #[serde(with = "crate::duration_millis")]
    pub duration: Duration,

    /// Attempts issued, including the accepted one
    pub attempts: u32,

    /// Dispatched after the task deadline
    #[serde(default)]
    pub late: bool,
}

impl TaskResult {
    /// Result for one handle withdrawn from a task other handles still await
    ///
    /// The task itself keeps running, so nothing is attributed to a worker.
    pub(crate) fn withdrawn(task_id: TaskId, sequence: Sequence) -> Self {
        Self {
            task_id,
            sequence,
            status: TaskStatus::Cancelled,
            payload: None,
            error: None,
            worker_id: None,
            duration: Duration::ZERO,
            attempts: 0,
            late: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Error kind of a failed result
    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.kind())
    }

    /// Convert into the caller-facing error taxonomy
    pub fn into_result(self) -> Result<Value, DispatchError> {
        match self.status {
            TaskStatus::Success => Ok(self.payload.unwrap_or(Value::Null)),
            TaskStatus::Timeout => Err(DispatchError::TaskTimeout {
                task_id: self.task_id,
                attempts: self.attempts,
            }),
            TaskStatus::Cancelled => Err(DispatchError::Cancelled(self.task_id)),
            TaskStatus::Failure => match self.error {
                Some(error) if error.kind() == Some(DEADLINE_MISSED) => {
                    Err(DispatchError::DeadlineMissed(self.task_id))
                }
                Some(error) if error.kind() == Some(POOL_UNAVAILABLE) => {
                    Err(DispatchError::PoolUnavailable(error.message))
                }
                Some(error) => Err(DispatchError::TaskFailed {
                    task_id: self.task_id,
                    error,
                }),
                None => Err(DispatchError::TaskFailed {
                    task_id: self.task_id,
                    error: TaskError::non_retryable("unknown failure"),
                }),
            },
        }
    }
}

/// A result released by the reorder buffer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub result: TaskResult,

    /// Released ahead of an unresolved earlier sequence
    pub out_of_order: bool,
}

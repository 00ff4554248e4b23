//! Caller-side handle to a submitted task

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::control::Command;
use crate::error::DispatchError;
use crate::protocol::Sequence;
use crate::task::{TaskId, TaskResult};

#[derive(Debug)]
pub(crate) enum Outcome {
    /// Known already (duplicate of a resolved task)
    Ready(TaskResult),
    /// Delivered by the control loop once released in order
    Pending(oneshot::Receiver<TaskResult>),
}

/// Identifies one handle among those waiting on a sequence
pub(crate) type WaiterId = u64;

/// What the control loop hands back for an admitted submission
#[derive(Debug)]
pub(crate) struct Admitted {
    pub task_id: TaskId,
    pub sequence: Sequence,
    pub duplicate: bool,
    /// Set while the outcome is pending
    pub waiter: Option<WaiterId>,
    pub outcome: Outcome,
}

/// Handle returned by [`DispatchEngine::submit`](super::DispatchEngine::submit)
///
/// # Example
///
/// ```ignore
/// let handle = engine.submit(TaskSpec::new("resize", json!({"w": 64}))).await?;
/// if handle.is_duplicate() {
///     info!(task_id = %handle.task_id(), "already submitted");
/// }
/// let result = handle.result().await?;
/// ```
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    sequence: Sequence,
    duplicate: bool,
    waiter: Option<WaiterId>,
    outcome: Outcome,
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskHandle {
    pub(crate) fn new(admitted: Admitted, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            task_id: admitted.task_id,
            sequence: admitted.sequence,
            duplicate: admitted.duplicate,
            waiter: admitted.waiter,
            outcome: admitted.outcome,
            commands,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Engine-assigned sequence (shared with the original for duplicates)
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// The submission matched a task already seen; nothing new was dispatched
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Wait for the final result
    ///
    /// Returns `EngineStopped` if the engine shut down before the task
    /// resolved. Timeouts and failures are results, not errors; use
    /// [`output`](Self::output) to fold them into [`DispatchError`].
    pub async fn result(self) -> Result<TaskResult, DispatchError> {
        match self.outcome {
            Outcome::Ready(result) => Ok(result),
            Outcome::Pending(rx) => rx.await.map_err(|_| DispatchError::EngineStopped),
        }
    }

    /// Wait for the payload of a successful result
    pub async fn output(self) -> Result<Value, DispatchError> {
        self.result().await?.into_result()
    }

    /// Run `callback` with the result once it is known
    pub fn on_result<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<TaskResult, DispatchError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.result().await;
            callback(result);
        })
    }

    /// Request cancellation
    ///
    /// The task resolves as `Cancelled` (still in sequence order) unless it
    /// already resolved. A running attempt is asked to stop cooperatively.
    ///
    /// When other handles share the task (duplicate submissions), only this
    /// handle is withdrawn: it resolves as `Cancelled` while the task runs on
    /// for the rest. The task itself is cancelled once no other handle waits.
    pub fn cancel(&self) -> Result<(), DispatchError> {
        let Some(waiter) = self.waiter else {
            // Resolved before this handle existed
            return Ok(());
        };
        self.commands
            .send(Command::Cancel {
                sequence: self.sequence,
                waiter,
            })
            .map_err(|_| DispatchError::EngineStopped)
    }
}

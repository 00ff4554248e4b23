//! Execution context handed to task bodies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::TaskId;
use crate::pool::{WorkerEvent, WorkerId};
use crate::protocol::{Envelope, Sequence};
use crate::reliability::{CircuitBreaker, CircuitBreakerRegistry};
use crate::sync::SyncRegistry;

/// Error from acknowledgment
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// Worker channel closed (engine stopped)
    #[error("ack channel closed")]
    ChannelClosed,

    /// Attempt was cancelled
    #[error("task was cancelled")]
    Cancelled,
}

/// Shared services reachable from every task body
#[derive(Debug, Clone)]
pub struct TaskServices {
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub shared: Arc<SyncRegistry>,
}

impl Default for TaskServices {
    fn default() -> Self {
        Self {
            circuits: Arc::new(CircuitBreakerRegistry::default()),
            shared: Arc::new(SyncRegistry::default()),
        }
    }
}

/// Context provided to task bodies during execution
///
/// The context provides:
/// - Information about the current attempt
/// - Explicit acknowledgment, which stops the ack-deadline timer
/// - Cooperative cancellation
/// - Named circuit breakers and atomic coordination primitives
///
/// # Example
///
/// ```ignore
/// engine.register_handler("transcode", |ctx, input| async move {
///     ctx.ack().await?; // long job: stop the ack-deadline timer
///     for chunk in chunks(&input) {
///         if ctx.is_cancelled() {
///             return Err(TaskError::non_retryable("cancelled"));
///         }
///         encode(chunk).await?;
///     }
///     Ok(json!({"done": true}))
/// });
/// ```
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task being executed
    pub task_id: TaskId,

    /// Registered kind of the task
    pub kind: String,

    /// Engine-assigned sequence
    pub sequence: Sequence,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Worker running this attempt
    pub worker_id: WorkerId,

    /// Task deadline, if any
    pub deadline: Option<Instant>,

    cancel: CancellationToken,
    acked: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    services: TaskServices,
}

impl TaskContext {
    pub(crate) fn new(
        envelope: &Envelope,
        worker_id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
        services: TaskServices,
    ) -> Self {
        Self {
            task_id: envelope.task.id.clone(),
            kind: envelope.task.kind.clone(),
            sequence: envelope.sequence,
            attempt: envelope.attempt,
            max_attempts: envelope.task.max_attempts,
            worker_id,
            deadline: envelope.task.deadline,
            cancel: CancellationToken::new(),
            acked: Arc::new(AtomicBool::new(false)),
            events: Some(events),
            services,
        }
    }

    /// Context not attached to any engine, for exercising task bodies directly
    pub fn detached(task_id: impl Into<TaskId>, attempt: u32, max_attempts: u32) -> Self {
        Self {
            task_id: task_id.into(),
            kind: String::new(),
            sequence: 0,
            attempt,
            max_attempts,
            worker_id: WorkerId::new(0),
            deadline: None,
            cancel: CancellationToken::new(),
            acked: Arc::new(AtomicBool::new(false)),
            events: None,
            services: TaskServices::default(),
        }
    }

    /// Acknowledge receipt of the envelope
    ///
    /// Cancels the ack-deadline timer for this attempt. Only the first call
    /// sends anything; a result acknowledges implicitly.
    ///
    /// The first call yields once after sending so the control loop can run
    /// even if the body goes on to block its thread. Bodies doing blocking
    /// work should still move it to `spawn_blocking`.
    pub async fn ack(&self) -> Result<(), AckError> {
        if self.is_cancelled() {
            return Err(AckError::Cancelled);
        }
        if self.acked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(events) = &self.events {
            events
                .send(WorkerEvent::Acked {
                    worker: self.worker_id,
                    sequence: self.sequence,
                    attempt: self.attempt,
                })
                .map_err(|_| AckError::ChannelClosed)?;
            // The woken control loop may sit in this thread's LIFO slot
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Whether `ack` has been called
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(TaskError::non_retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Check if this is the last attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Circuit breaker guarding the named dependency
    pub fn circuit(&self, name: &str) -> Arc<CircuitBreaker> {
        self.services.circuits.get(name)
    }

    /// Counters, latches and barriers shared between task bodies
    pub fn shared(&self) -> &SyncRegistry {
        &self.services.shared
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

//! Worker tasks and the messages they exchange with the control loop

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::TaskError;
use crate::protocol::{Envelope, Sequence};
use crate::task::{HandlerRegistry, TaskContext, TaskFuture, TaskServices, WarmUpFn};

/// Error kind of a task whose kind has no registered body
pub const UNKNOWN_TASK_KIND: &str = "unknown_task_kind";

/// Worker identifier, unique for the lifetime of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, running warm-up; not offered to the scheduler
    Starting,
    /// Ready for an envelope
    Idle,
    /// Holding an envelope
    Busy,
    /// Finishing its current envelope before it is removed
    Draining,
    /// Missed heartbeats; may still recover
    Unresponsive,
    /// Exited or force-crashed; awaiting removal
    Crashed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Unresponsive => "unresponsive",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Control loop to worker
#[derive(Debug)]
pub enum WorkerCommand {
    Run(Envelope),
    Ping { nonce: u64 },
    /// Cooperatively cancel this attempt if it is running
    Cancel { sequence: Sequence, attempt: u32 },
    /// Finish the current envelope, then exit
    Shutdown,
}

/// Why a worker task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Shut down on request or because the engine went away
    Stopped,
    WarmUpFailed(String),
    Panicked(String),
    Aborted,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::WarmUpFailed(msg) => write!(f, "warm-up failed: {}", msg),
            Self::Panicked(msg) => write!(f, "panicked: {}", msg),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Worker to control loop
#[derive(Debug)]
pub enum WorkerEvent {
    Ready {
        worker: WorkerId,
    },
    Pong {
        worker: WorkerId,
        nonce: u64,
    },
    Acked {
        worker: WorkerId,
        sequence: Sequence,
        attempt: u32,
    },
    Finished {
        worker: WorkerId,
        sequence: Sequence,
        attempt: u32,
        outcome: Result<Value, TaskError>,
        duration: Duration,
    },
    Exited {
        worker: WorkerId,
        reason: ExitReason,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Ready { worker }
            | Self::Pong { worker, .. }
            | Self::Acked { worker, .. }
            | Self::Finished { worker, .. }
            | Self::Exited { worker, .. } => *worker,
        }
    }
}

/// Errors from spawning a worker
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpawnError {
    /// No tokio runtime on the current thread
    #[error("no tokio runtime available to spawn workers")]
    NoRuntime,

    /// Spawner declined to start a worker
    #[error("worker spawn rejected: {0}")]
    Rejected(String),
}

/// Control loop side of a worker
#[derive(Debug)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    abort: Option<AbortHandle>,
}

impl WorkerHandle {
    pub fn new(commands: mpsc::UnboundedSender<WorkerCommand>, abort: Option<AbortHandle>) -> Self {
        Self { commands, abort }
    }

    /// Send a command; hands it back if the worker is gone
    pub fn send(&self, command: WorkerCommand) -> Result<(), WorkerCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }

    /// Kill the worker task outright
    pub fn abort(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Starts workers for the pool manager
///
/// Spawning is synchronous; warm-up runs inside the worker and is reported
/// through [`WorkerEvent::Ready`] or [`WorkerEvent::Exited`].
pub trait WorkerSpawner: Send + Sync + std::fmt::Debug {
    fn spawn(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle, SpawnError>;
}

/// Spawns workers as tokio tasks running registered task bodies
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    handlers: Arc<HandlerRegistry>,
    warm_up: Option<WarmUpFnDebug>,
    services: TaskServices,
}

#[derive(Clone)]
struct WarmUpFnDebug(WarmUpFn);

impl std::fmt::Debug for WarmUpFnDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WarmUpFn")
    }
}

impl TaskSpawner {
    pub fn new(handlers: Arc<HandlerRegistry>, services: TaskServices) -> Self {
        Self {
            handlers,
            warm_up: None,
            services,
        }
    }

    pub fn with_warm_up(mut self, warm_up: Option<WarmUpFn>) -> Self {
        self.warm_up = warm_up.map(WarmUpFnDebug);
        self
    }
}

impl WorkerSpawner for TaskSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            id,
            commands: commands_rx,
            events: events.clone(),
            handlers: self.handlers.clone(),
            services: self.services.clone(),
            backlog: VecDeque::new(),
        };
        let warm_up = self.warm_up.clone().map(|w| w.0);
        let span = tracing::info_span!("worker", worker_id = %id);
        let join = runtime.spawn(worker.run(warm_up).instrument(span));
        let abort = join.abort_handle();

        // Supervisor: turns every way the worker task can end into an event
        runtime.spawn(async move {
            let reason = match join.await {
                Ok(reason) => reason,
                Err(e) if e.is_panic() => ExitReason::Panicked(panic_message(e.into_panic())),
                Err(_) => ExitReason::Aborted,
            };
            let _ = events.send(WorkerEvent::Exited { worker: id, reason });
        });

        Ok(WorkerHandle::new(commands_tx, Some(abort)))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Worker {
    id: WorkerId,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    handlers: Arc<HandlerRegistry>,
    services: TaskServices,
    backlog: VecDeque<Envelope>,
}

impl Worker {
    async fn run(mut self, warm_up: Option<WarmUpFn>) -> ExitReason {
        if let Some(warm_up) = warm_up {
            if let Err(e) = warm_up(self.id).await {
                warn!(worker_id = %self.id, error = %e, "warm-up failed");
                return ExitReason::WarmUpFailed(e.message);
            }
        }

        if self.events.send(WorkerEvent::Ready { worker: self.id }).is_err() {
            return ExitReason::Stopped;
        }
        debug!(worker_id = %self.id, "worker ready");

        loop {
            if let Some(envelope) = self.backlog.pop_front() {
                if !self.execute(envelope).await {
                    break;
                }
                continue;
            }

            match self.commands.recv().await {
                Some(WorkerCommand::Run(envelope)) => {
                    if !self.execute(envelope).await {
                        break;
                    }
                }
                Some(WorkerCommand::Ping { nonce }) => self.pong(nonce),
                Some(WorkerCommand::Cancel { .. }) => {}
                Some(WorkerCommand::Shutdown) | None => break,
            }
        }

        info!(worker_id = %self.id, "worker stopped");
        ExitReason::Stopped
    }

    /// Run one envelope, answering pings meanwhile. Returns false when the
    /// worker should exit afterwards.
    async fn execute(&mut self, envelope: Envelope) -> bool {
        let ctx = TaskContext::new(&envelope, self.id, self.events.clone(), self.services.clone());
        let token = ctx.cancellation_token();
        let started = Instant::now();
        debug!(
            worker_id = %self.id,
            sequence = envelope.sequence,
            attempt = envelope.attempt,
            kind = %envelope.task.kind,
            "running task"
        );

        let mut body: TaskFuture = match self.handlers.get(&envelope.task.kind) {
            Some(handler) => handler(ctx, envelope.task.input.clone()),
            None => {
                let error = TaskError::non_retryable(format!(
                    "no task body registered for kind '{}'",
                    envelope.task.kind
                ))
                .with_kind(UNKNOWN_TASK_KIND);
                async move { Err(error) }.boxed()
            }
        };

        let mut keep_running = true;
        let outcome = loop {
            tokio::select! {
                outcome = &mut body => break outcome,
                command = self.commands.recv(), if keep_running => match command {
                    Some(WorkerCommand::Ping { nonce }) => self.pong(nonce),
                    Some(WorkerCommand::Cancel { sequence, attempt })
                        if sequence == envelope.sequence && attempt == envelope.attempt =>
                    {
                        debug!(worker_id = %self.id, sequence, attempt, "cancelling running task");
                        token.cancel();
                    }
                    Some(WorkerCommand::Cancel { .. }) => {}
                    Some(WorkerCommand::Run(next)) => {
                        warn!(worker_id = %self.id, sequence = next.sequence, "envelope received while busy, queued locally");
                        self.backlog.push_back(next);
                    }
                    Some(WorkerCommand::Shutdown) | None => keep_running = false,
                },
            }
        };

        let duration = started.elapsed();
        if let Err(e) = &outcome {
            debug!(worker_id = %self.id, sequence = envelope.sequence, error = %e, "task failed");
        }
        let finished = WorkerEvent::Finished {
            worker: self.id,
            sequence: envelope.sequence,
            attempt: envelope.attempt,
            outcome,
            duration,
        };
        if self.events.send(finished).is_err() {
            error!(worker_id = %self.id, "control loop gone, dropping result");
            return false;
        }
        keep_running
    }

    fn pong(&self, nonce: u64) {
        let _ = self.events.send(WorkerEvent::Pong {
            worker: self.id,
            nonce,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use serde_json::json;

    fn envelope(sequence: Sequence, kind: &str) -> Envelope {
        let now = Instant::now();
        let task = TaskSpec::new(kind, json!({"n": sequence})).into_task(Duration::from_secs(1), 3, now);
        Envelope {
            sequence,
            attempt: 1,
            task: Arc::new(task),
            sent_at: now,
            ack_deadline: now + Duration::from_secs(1),
            late: false,
        }
    }

    fn spawner() -> TaskSpawner {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("echo", |_ctx, input| async move { Ok(input) });
        handlers.register("boom", |_ctx, _input| async move {
            panic!("boom");
        });
        handlers.register("wait_cancel", |ctx: TaskContext, _input| async move {
            ctx.cancelled().await;
            Err(TaskError::non_retryable("cancelled"))
        });
        TaskSpawner::new(handlers, TaskServices::default())
    }

    #[tokio::test]
    async fn test_worker_reports_ready_and_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawner().spawn(WorkerId::new(1), tx).unwrap();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Ready { .. })));
        handle.send(WorkerCommand::Run(envelope(1, "echo"))).unwrap();

        match rx.recv().await {
            Some(WorkerEvent::Finished { sequence, outcome, .. }) => {
                assert_eq!(sequence, 1);
                assert_eq!(outcome.unwrap(), json!({"n": 1}));
            }
            other => panic!("unexpected event {other:?}"),
        }

        handle.send(WorkerCommand::Shutdown).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Exited { reason: ExitReason::Stopped, .. })
        ));
    }

    #[tokio::test]
    async fn test_panicking_body_exits_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawner().spawn(WorkerId::new(2), tx).unwrap();
        rx.recv().await;

        handle.send(WorkerCommand::Run(envelope(1, "boom"))).unwrap();
        match rx.recv().await {
            Some(WorkerEvent::Exited { reason: ExitReason::Panicked(msg), .. }) => {
                assert_eq!(msg, "boom")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawner().spawn(WorkerId::new(3), tx).unwrap();
        rx.recv().await;

        handle.send(WorkerCommand::Run(envelope(1, "missing"))).unwrap();
        match rx.recv().await {
            Some(WorkerEvent::Finished { outcome: Err(e), .. }) => {
                assert!(!e.retryable);
                assert_eq!(e.kind(), Some(UNKNOWN_TASK_KIND));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_and_cancel_while_busy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawner().spawn(WorkerId::new(4), tx).unwrap();
        rx.recv().await;

        handle.send(WorkerCommand::Run(envelope(7, "wait_cancel"))).unwrap();
        handle.send(WorkerCommand::Ping { nonce: 42 }).unwrap();
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Pong { nonce: 42, .. })));

        handle
            .send(WorkerCommand::Cancel { sequence: 7, attempt: 1 })
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Finished { sequence: 7, outcome: Err(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_warm_up() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let warm_up: WarmUpFn = Arc::new(|_id| async { Err(TaskError::non_retryable("no gpu")) }.boxed());
        let spawner = spawner().with_warm_up(Some(warm_up));
        let _handle = spawner.spawn(WorkerId::new(5), tx).unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Exited { reason: ExitReason::WarmUpFailed(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_reports_aborted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawner().spawn(WorkerId::new(6), tx).unwrap();
        rx.recv().await;

        handle.abort();
        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Exited { reason: ExitReason::Aborted, .. })
        ));
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId::new(3).to_string(), "worker-3");
        assert_eq!(serde_json::to_value(WorkerId::new(3)).unwrap(), json!(3));
    }
}

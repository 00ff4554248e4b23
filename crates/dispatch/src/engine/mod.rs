//! Dispatch engine facade
//!
//! This module provides:
//! - [`DispatchEngine`] - Submission, handles, pool control and subscriptions
//! - [`EngineConfig`] - Configuration for every component
//! - [`TaskHandle`] - Future-style and callback access to one result
//! - [`EngineEvent`] - Lifecycle and telemetry events
//!
//! # Example
//!
//! ```
//! use relaykit_dispatch::{DispatchEngine, EngineConfig, PoolConfig, TaskSpec};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), relaykit_dispatch::DispatchError> {
//! let engine = DispatchEngine::new(EngineConfig::default().with_pool(PoolConfig::fixed(2)))?;
//! engine.register_handler("double", |_ctx, input| async move {
//!     let n = input["n"].as_i64().unwrap_or(0);
//!     Ok(json!(n * 2))
//! });
//! engine.start().await?;
//!
//! let handle = engine.submit(TaskSpec::new("double", json!({"n": 21}))).await?;
//! assert_eq!(handle.output().await?, json!(42));
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod control;
mod events;
mod handle;
mod stats;

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Instrument};

pub use config::{ChannelConfig, ConfigError, EngineConfig};
pub use events::{EngineEvent, EngineEventKind};
pub use handle::TaskHandle;
pub use stats::EngineStats;

use crate::clock::TokioClock;
use crate::error::{DispatchError, TaskError};
use crate::health::HealthMonitor;
use crate::pool::{AdmissionMode, BackpressureState, PoolConfig, PoolManager, TaskSpawner, WorkerId};
use crate::protocol::DeliveryProtocol;
use crate::reliability::{CircuitBreakerRegistry, CircuitState};
use crate::scheduler::Scheduler;
use crate::sync::SyncRegistry;
use crate::task::{Delivery, HandlerRegistry, TaskBody, TaskContext, TaskServices, TaskSpec, WarmUpFn};
use control::{Command, ControlLoop, ControlParts};

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    join: JoinHandle<Result<(), DispatchError>>,
}

/// In-process task dispatch engine
///
/// Register task bodies, `start`, then `submit`. Every accepted task
/// resolves exactly once, in submission order, as success, failure,
/// timeout or cancellation.
pub struct DispatchEngine {
    config: EngineConfig,
    pool_config: RwLock<PoolConfig>,
    handlers: Arc<HandlerRegistry>,
    services: TaskServices,
    warm_up: RwLock<Option<WarmUpFn>>,
    backpressure: Arc<BackpressureState>,
    capacity: Arc<Notify>,
    events: broadcast::Sender<EngineEvent>,
    results: broadcast::Sender<Delivery>,
    running: Mutex<Option<Running>>,
}

impl DispatchEngine {
    /// Create an engine; nothing runs until [`start`](Self::start)
    pub fn new(config: EngineConfig) -> Result<Self, DispatchError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.channels.event_capacity);
        let (results, _) = broadcast::channel(config.channels.result_capacity);

        let circuits = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            Arc::new(TokioClock),
        ));
        let circuit_events = events.clone();
        circuits.set_listener(Arc::new(move |name: &str, _from, to| {
            let kind = match to {
                CircuitState::Open => EngineEventKind::CircuitOpened {
                    circuit: name.to_string(),
                },
                CircuitState::Closed => EngineEventKind::CircuitClosed {
                    circuit: name.to_string(),
                },
                CircuitState::HalfOpen => return,
            };
            let _ = circuit_events.send(EngineEvent::now(kind));
        }));

        Ok(Self {
            pool_config: RwLock::new(config.pool.clone()),
            handlers: Arc::new(HandlerRegistry::new()),
            services: TaskServices {
                circuits,
                shared: Arc::new(SyncRegistry::new()),
            },
            warm_up: RwLock::new(None),
            backpressure: Arc::new(BackpressureState::new(config.backpressure.clone())),
            capacity: Arc::new(Notify::new()),
            events,
            results,
            running: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a task body for `kind`
    ///
    /// Bodies registered after `start` are picked up by workers spawned later
    /// as well as running ones; the registry is shared.
    pub fn register_handler<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.handlers.register(kind, handler);
    }

    /// Register a typed task body under its `KIND`
    pub fn register_body<B: TaskBody>(&self, body: B) {
        self.handlers.register_body(body);
    }

    /// One-time initializer each new worker runs before it reports ready
    ///
    /// Takes effect for workers spawned by the next `start`.
    pub fn set_warm_up<F, Fut>(&self, warm_up: F)
    where
        F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let warm_up: WarmUpFn = Arc::new(move |id| warm_up(id).boxed());
        *self.warm_up.write() = Some(warm_up);
    }

    /// Start the control loop and the minimum number of workers
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        let pool_config = self.pool_config.read().clone();
        info!(
            min_workers = pool_config.min_workers,
            max_workers = pool_config.max_workers,
            scheduling = %self.config.scheduling,
            kinds = ?self.handlers.kinds(),
            "Starting dispatch engine"
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let spawner = TaskSpawner::new(self.handlers.clone(), self.services.clone())
            .with_warm_up(self.warm_up.read().clone());

        let parts = ControlParts {
            protocol: DeliveryProtocol::new(self.config.protocol.clone()),
            scheduler: Scheduler::new(self.config.scheduling.clone(), Instant::now()),
            health: HealthMonitor::from_config(&pool_config),
            pool: PoolManager::new(pool_config, Arc::new(spawner), worker_tx),
            handlers: self.handlers.clone(),
            circuits: self.services.circuits.clone(),
            backpressure: self.backpressure.clone(),
            capacity: self.capacity.clone(),
            results: self.results.clone(),
            events: self.events.clone(),
            commands: commands_rx,
            worker_events: worker_rx,
            shutdown: shutdown.clone(),
        };

        let join = tokio::spawn(
            ControlLoop::new(parts)
                .run(self.config.shutdown_timeout)
                .instrument(tracing::info_span!("control_loop")),
        );

        *running = Some(Running {
            commands: commands_tx,
            shutdown,
            join,
        });
        Ok(())
    }

    /// Submit a task
    ///
    /// Fails with `TaskRejected` when admission control is closed (after
    /// waiting, in [`AdmissionMode::Wait`]), `UnknownTaskKind` when no body
    /// is registered and `PoolUnavailable` when no worker can run. A
    /// duplicate returns a handle that reports [`TaskHandle::is_duplicate`].
    #[instrument(skip(self, spec), fields(kind = %spec.kind))]
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle, DispatchError> {
        let commands = self.commands()?;
        let wait_until = match self.config.backpressure.admission {
            AdmissionMode::Reject => None,
            AdmissionMode::Wait { timeout } => Some(Instant::now() + timeout),
        };

        loop {
            // Registered before asking, so a release in between is not missed
            let capacity = self.capacity.notified();
            tokio::pin!(capacity);
            capacity.as_mut().enable();

            let (reply, rx) = oneshot::channel();
            commands
                .send(Command::Submit {
                    spec: spec.clone(),
                    reply,
                })
                .map_err(|_| DispatchError::EngineStopped)?;

            match rx.await.map_err(|_| DispatchError::EngineStopped)? {
                Ok(admitted) => return Ok(TaskHandle::new(admitted, commands)),
                Err(err) if err.is_rejected() => {
                    let Some(deadline) = wait_until else {
                        return Err(self.reject(err));
                    };
                    if tokio::time::timeout_at(deadline, capacity).await.is_err() {
                        return Err(self.reject(err));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replace the pool configuration and bring the pool into its bounds
    #[instrument(skip(self, config))]
    pub async fn configure(&self, config: PoolConfig) -> Result<(), DispatchError> {
        config.validate().map_err(DispatchError::InvalidConfig)?;
        *self.pool_config.write() = config.clone();

        let (reply, rx) = oneshot::channel();
        self.send(Command::Configure { config, reply })?;
        rx.await.map_err(|_| DispatchError::EngineStopped)
    }

    /// Grow or shrink toward `target`, clamped to min/max; returns the live count
    #[instrument(skip(self))]
    pub async fn resize(&self, target: usize) -> Result<usize, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resize { target, reply })?;
        rx.await.map_err(|_| DispatchError::EngineStopped)
    }

    /// Kill a worker and spawn a replacement; its task is retried
    #[instrument(skip(self))]
    pub async fn replace_worker(&self, worker: WorkerId) -> Result<bool, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Replace { worker, reply })?;
        rx.await.map_err(|_| DispatchError::EngineStopped)
    }

    pub async fn stats(&self) -> Result<EngineStats, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| DispatchError::EngineStopped)
    }

    /// Every released result, in sequence order
    pub fn subscribe_results(&self) -> broadcast::Receiver<Delivery> {
        self.results.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Circuit breakers shared with task bodies
    pub fn circuits(&self) -> Arc<CircuitBreakerRegistry> {
        self.services.circuits.clone()
    }

    /// Counters, latches and barriers shared with task bodies
    pub fn shared(&self) -> Arc<SyncRegistry> {
        self.services.shared.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop accepting work, let running tasks finish and stop the workers
    ///
    /// Queued tasks are dropped; their handles report `EngineStopped`.
    /// Returns `ShutdownTimeout` if workers were still running when
    /// `shutdown_timeout` elapsed (they are aborted).
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        info!("Initiating graceful shutdown");
        running.shutdown.cancel();
        match running.join.await {
            Ok(outcome) => {
                info!("Dispatch engine stopped");
                outcome
            }
            Err(e) => {
                warn!(error = %e, "control loop ended abnormally");
                Err(DispatchError::EngineStopped)
            }
        }
    }

    fn commands(&self) -> Result<mpsc::UnboundedSender<Command>, DispatchError> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.commands.clone())
            .ok_or(DispatchError::NotRunning)
    }

    fn send(&self, command: Command) -> Result<(), DispatchError> {
        self.commands()?
            .send(command)
            .map_err(|_| DispatchError::EngineStopped)
    }

    fn reject(&self, err: DispatchError) -> DispatchError {
        self.backpressure.record_rejection();
        let reason = match &err {
            DispatchError::TaskRejected { reason } => reason.clone(),
            other => other.to_string(),
        };
        warn!(%reason, outstanding = self.backpressure.outstanding(), "submission rejected");
        let _ = self.events.send(EngineEvent::now(EngineEventKind::TaskBackpressured {
            reason,
            outstanding: self.backpressure.outstanding(),
        }));
        err
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("scheduling", &self.config.scheduling)
            .field("kinds", &self.handlers.kinds())
            .field("running", &self.is_running())
            .finish()
    }
}

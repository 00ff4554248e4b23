//! # Resilient Task Dispatch Engine
//!
//! An in-process worker pool fed by a pluggable scheduler and wrapped in an
//! at-least-once delivery protocol.
//!
//! ## Features
//!
//! - **At-least-once delivery**: Ack deadlines with exponential backoff, retries on another worker
//! - **Deduplication**: Idempotency keys or content fingerprints, one execution per logical task
//! - **Ordered results**: Results are released in submission order through a bounded reorder buffer
//! - **Scheduling policies**: Priority, fair-share, weighted round-robin, deadline, work-stealing; least-loaded worker choice
//! - **Elastic pool**: Warm-up, idle reclaim, crash replacement and backlog scale-up
//! - **Health monitoring**: Heartbeats, unresponsive detection and forced replacement
//! - **Circuit breakers and backpressure**: Failure isolation and admission control
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DispatchEngine                          │
//! │  (submit, task handles, pool control, event subscriptions)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ commands
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ControlLoop                            │
//! │  DeliveryProtocol ─ Scheduler ─ HealthMonitor ─ PoolManager │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ envelopes / worker events
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Workers                              │
//! │  (warm up, run task bodies, ack, heartbeat, honour cancel)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use relaykit_dispatch::prelude::*;
//!
//! let engine = DispatchEngine::new(
//!     EngineConfig::default()
//!         .with_pool(PoolConfig::new().with_size(2, 8))
//!         .with_scheduling(SchedulingPolicy::priority_with_aging(0.5)),
//! )?;
//!
//! engine.register_handler("thumbnail", |ctx, input| async move {
//!     ctx.ack().await?;
//!     render(input).await
//! });
//! engine.start().await?;
//!
//! let handle = engine
//!     .submit(TaskSpec::new("thumbnail", json!({"id": 7})).with_priority(10))
//!     .await?;
//! let result = handle.result().await?;
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod reliability;
pub mod scheduler;
pub mod sync;
pub mod task;

pub(crate) mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{DispatchEngine, EngineConfig, EngineEvent, EngineEventKind, TaskHandle};
    pub use crate::error::{DispatchError, TaskError};
    pub use crate::pool::{AdmissionMode, BackpressureConfig, PoolConfig, WorkerId, WorkerState};
    pub use crate::protocol::ProtocolConfig;
    pub use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    pub use crate::scheduler::SchedulingPolicy;
    pub use crate::task::{TaskBody, TaskContext, TaskResult, TaskSpec, TaskStatus};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, TokioClock};
pub use engine::{
    ChannelConfig, ConfigError, DispatchEngine, EngineConfig, EngineEvent, EngineEventKind,
    EngineStats, TaskHandle,
};
pub use error::{DispatchError, TaskError};
pub use pool::{AdmissionMode, BackpressureConfig, PoolConfig, WorkerId, WorkerState};
pub use protocol::{ProtocolConfig, Sequence};
pub use reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, RetryPolicy};
pub use scheduler::SchedulingPolicy;
pub use sync::SyncRegistry;
pub use task::{
    Delivery, TaskBody, TaskContext, TaskId, TaskOptions, TaskResult, TaskSpec, TaskStatus,
};

//! Worker pool
//!
//! This module provides:
//! - [`PoolManager`] - Worker records, scaling, crash replacement
//! - [`PoolConfig`] - Pool sizing and health timing
//! - [`BackpressureState`] - Watermark admission control
//! - [`TaskSpawner`] - Runs workers as tokio tasks
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      control loop                          │
//! │   PoolManager ── WorkerRecord (state, envelope, load) ...  │
//! └──────┬───────────────────────────────────────▲────────────┘
//!        │ WorkerCommand                          │ WorkerEvent
//!        │ (Run / Ping / Cancel / Shutdown)       │ (Ready / Pong / Acked /
//!        ▼                                        │  Finished / Exited)
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐ │
//! │  worker-1   │ │  worker-2   │ │  worker-N   │─┘
//! │ (tokio task)│ │ (tokio task)│ │ (tokio task)│
//! └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! Every worker has a supervisor task that awaits its join handle, so a
//! panic or abort always surfaces as `WorkerEvent::Exited`.

mod backpressure;
mod config;
mod manager;
mod record;
mod worker;

pub use backpressure::{AdmissionMode, BackpressureConfig, BackpressureError, BackpressureState};
pub use config::PoolConfig;
pub use manager::{PoolEvent, PoolManager};
pub use record::{WorkerRecord, WorkerSnapshot};
pub use worker::{
    ExitReason, SpawnError, TaskSpawner, WorkerCommand, WorkerEvent, WorkerHandle, WorkerId,
    WorkerSpawner, WorkerState, UNKNOWN_TASK_KIND,
};

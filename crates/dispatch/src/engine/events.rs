//! Lifecycle and telemetry events

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pool::WorkerId;
use crate::protocol::{RetryReason, Sequence};
use crate::task::TaskId;

/// Event published on the engine's broadcast channel
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn now(kind: EngineEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Dotted event name, e.g. `worker.crashed`
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EngineEventKind {
    #[serde(rename = "worker.spawned")]
    WorkerSpawned { worker: WorkerId },

    #[serde(rename = "worker.ready")]
    WorkerReady { worker: WorkerId },

    #[serde(rename = "worker.crashed")]
    WorkerCrashed {
        worker: WorkerId,
        reason: String,
        /// Sequence of the envelope it was holding
        #[serde(skip_serializing_if = "Option::is_none")]
        abandoned: Option<Sequence>,
    },

    #[serde(rename = "worker.unresponsive")]
    WorkerUnresponsive {
        worker: WorkerId,
        #[serde(with = "crate::duration_millis")]
        silent_for: Duration,
    },

    #[serde(rename = "worker.recovered")]
    WorkerRecovered { worker: WorkerId },

    #[serde(rename = "worker.slow")]
    WorkerSlow {
        worker: WorkerId,
        #[serde(with = "crate::duration_millis")]
        round_trip: Duration,
    },

    #[serde(rename = "worker.reclaimed")]
    WorkerReclaimed { worker: WorkerId },

    #[serde(rename = "task.retried")]
    TaskRetried {
        task_id: TaskId,
        sequence: Sequence,
        attempt: u32,
        reason: RetryReason,
        #[serde(with = "crate::duration_millis")]
        delay: Duration,
    },

    #[serde(rename = "task.backpressured")]
    TaskBackpressured { reason: String, outstanding: usize },

    #[serde(rename = "task.late")]
    TaskLate { task_id: TaskId, sequence: Sequence },

    #[serde(rename = "task.out_of_order")]
    TaskOutOfOrder { task_id: TaskId, sequence: Sequence },

    #[serde(rename = "circuit.opened")]
    CircuitOpened { circuit: String },

    #[serde(rename = "circuit.closed")]
    CircuitClosed { circuit: String },

    #[serde(rename = "pool.unavailable")]
    PoolUnavailable { reason: String },
}

impl EngineEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerSpawned { .. } => "worker.spawned",
            Self::WorkerReady { .. } => "worker.ready",
            Self::WorkerCrashed { .. } => "worker.crashed",
            Self::WorkerUnresponsive { .. } => "worker.unresponsive",
            Self::WorkerRecovered { .. } => "worker.recovered",
            Self::WorkerSlow { .. } => "worker.slow",
            Self::WorkerReclaimed { .. } => "worker.reclaimed",
            Self::TaskRetried { .. } => "task.retried",
            Self::TaskBackpressured { .. } => "task.backpressured",
            Self::TaskLate { .. } => "task.late",
            Self::TaskOutOfOrder { .. } => "task.out_of_order",
            Self::CircuitOpened { .. } => "circuit.opened",
            Self::CircuitClosed { .. } => "circuit.closed",
            Self::PoolUnavailable { .. } => "pool.unavailable",
        }
    }
}

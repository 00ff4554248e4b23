//! Point-in-time engine statistics

use std::collections::BTreeMap;

use serde::Serialize;

use crate::pool::{WorkerSnapshot, WorkerState};
use crate::protocol::ProtocolStats;
use crate::reliability::CircuitState;
use crate::scheduler::SchedulerStats;

/// Snapshot returned by [`DispatchEngine::stats`](super::DispatchEngine::stats)
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Accepted tasks without a result yet
    pub in_flight: usize,

    /// Results held back for ordering
    pub buffered: usize,

    /// Tickets waiting in the scheduler
    pub queued: usize,

    /// Workers per state
    pub workers: BTreeMap<WorkerState, usize>,

    pub worker_details: Vec<WorkerSnapshot>,

    pub protocol: ProtocolStats,

    pub scheduler: SchedulerStats,

    /// Submissions refused by admission control
    pub rejected: u64,

    /// Reorder-buffer overflows
    pub forced_releases: u64,

    /// Whether admission control currently admits work
    pub accepting: bool,

    /// Outstanding tasks as a share of the admission limit
    pub admission_load: f64,

    /// Identities held by the dedup cache
    pub dedup_entries: usize,

    pub pool_unavailable: bool,

    pub circuits: Vec<(String, CircuitState)>,
}

impl EngineStats {
    /// Tasks that produced a result of any status
    pub fn completed(&self) -> u64 {
        self.protocol.succeeded + self.protocol.failed + self.protocol.timed_out + self.protocol.cancelled
    }

    pub fn retried(&self) -> u64 {
        self.protocol.retried
    }

    /// Workers counting toward pool size
    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|(state, _)| !matches!(state, WorkerState::Crashed | WorkerState::Draining))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn workers_in(&self, state: WorkerState) -> usize {
        self.workers.get(&state).copied().unwrap_or(0)
    }
}

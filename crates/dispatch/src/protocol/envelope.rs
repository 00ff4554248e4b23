//! Envelopes and queue tickets

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::task::Task;

/// Monotonic per-engine submission number
pub type Sequence = u64;

/// A task waiting in the scheduler for a worker
#[derive(Debug, Clone)]
pub struct Ticket {
    pub sequence: Sequence,
    pub attempt: u32,
    pub task: Arc<Task>,
}

/// An attempt in flight on a worker
///
/// Created by the delivery protocol when the scheduler assigns a ticket,
/// never mutated by the worker that receives it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sequence: Sequence,
    pub attempt: u32,
    pub task: Arc<Task>,
    pub sent_at: Instant,
    pub ack_deadline: Instant,

    /// Dispatched after the task deadline
    pub late: bool,
}

/// Ack timeout for an attempt: `ttl * 2^(attempt - 1)`, capped
///
/// The cap never shortens the first attempt below its own ttl.
pub fn ack_timeout(ttl: Duration, attempt: u32, cap: Duration) -> Duration {
    let cap = cap.max(ttl);
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    ttl.checked_mul(factor).map_or(cap, |timeout| timeout.min(cap))
}

//! Reliable delivery of tasks to workers
//!
//! The protocol tracks every accepted task from submission to its single
//! delivered result:
//!
//! ```text
//!  submit ──► Queued ──dispatch──► Running ──complete──► resolve ──► reorder ──► deliver
//!               ▲                    │  │
//!               │        ack timeout │  │ worker lost / retryable error
//!               │                    ▼  ▼
//!               └──── Backoff ◄──── retry (attempt + 1, ack timeout doubled)
//! ```
//!
//! - [`DeliveryProtocol`] - Sans-io state machine driven by the engine
//! - [`DedupCache`] - Bounded identity cache for idempotent submission
//! - [`ReorderBuffer`] - Releases results in submission order
//! - [`Envelope`] / [`Ticket`] - An attempt on a worker / in a queue

mod config;
mod dedup;
mod delivery;
mod envelope;
mod reorder;
mod timers;

pub use config::ProtocolConfig;
pub use dedup::{DedupCache, SeenTask};
pub use delivery::{
    DeliveryAction, DeliveryProtocol, Dispatch, ProtocolStats, RetryReason, Submission,
};
pub use envelope::{ack_timeout, Envelope, Sequence, Ticket};
pub use reorder::ReorderBuffer;

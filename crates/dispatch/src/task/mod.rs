//! Tasks: what callers submit and what task bodies see
//!
//! This module provides:
//! - [`TaskSpec`] - A submission with its options
//! - [`Task`] - The immutable record the engine tracks
//! - [`TaskContext`] - Per-attempt context for task bodies
//! - [`TaskResult`] - The outcome delivered to callers
//! - [`HandlerRegistry`] - Task bodies by kind

mod context;
mod definition;
mod handler;
mod result;

pub use context::{AckError, TaskContext, TaskServices};
pub use definition::{DedupKey, Task, TaskId, TaskOptions, TaskSpec, DEFAULT_SHARE_KEY};
pub use handler::{HandlerRegistry, TaskBody, TaskFuture, TaskHandler, WarmUpFn};
pub use result::{Delivery, TaskResult, TaskStatus};

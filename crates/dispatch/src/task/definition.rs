//! Task identity, submission options and the immutable task record

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// Share key used by fair-share scheduling when the caller sets none
pub const DEFAULT_SHARE_KEY: &str = "default";

/// Unique task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity used by the dedup cache
///
/// Resolution order: idempotency key, then a caller-assigned id, then a
/// fingerprint of the task kind and input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Idempotency(String),
    Id(TaskId),
    Fingerprint(String),
}

impl DedupKey {
    /// SHA-256 over the kind and the serialized input
    pub fn fingerprint(kind: &str, input: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(input.to_string().as_bytes());
        Self::Fingerprint(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idempotency(key) => write!(f, "key:{key}"),
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Fingerprint(hash) => write!(f, "sha256:{}", &hash[..hash.len().min(12)]),
        }
    }
}

/// Per-task submission options
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Higher runs first under priority scheduling
    pub priority: i64,

    /// Completion target; dispatch after it marks the task late
    pub deadline: Option<Instant>,

    /// Drop instead of running late
    pub hard_deadline: bool,

    /// Cost used by fair-share accounting (defaults to 1)
    pub weight: Option<u32>,

    /// Overrides the engine's default attempt budget
    pub max_attempts: Option<u32>,

    /// Overrides the engine's default ack timeout for the first attempt
    pub ttl: Option<Duration>,

    /// Callers sharing a key get at most one execution
    pub idempotency_key: Option<String>,

    /// Tenant key for fair-share scheduling
    pub share_key: Option<String>,

    /// Start a second attempt if the first is still running after this long
    pub speculate_after: Option<Duration>,

    /// Prefer a worker that last ran a task with the same key
    pub affinity_key: Option<String>,
}

/// A task as submitted by a caller
///
/// # Example
///
/// ```
/// use relaykit_dispatch::TaskSpec;
/// use serde_json::json;
///
/// let spec = TaskSpec::new("resize_image", json!({"width": 64}))
///     .with_priority(5)
///     .with_max_attempts(3)
///     .with_idempotency_key("img-42");
/// ```
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: Option<TaskId>,
    pub kind: String,
    pub input: Value,
    pub options: TaskOptions,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, input: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            input,
            options: TaskOptions::default(),
        }
    }

    /// Assign an explicit id (also used for deduplication)
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_deadline_in(self, within: Duration) -> Self {
        self.with_deadline(Instant::now() + within)
    }

    /// Drop the task rather than run it after its deadline
    pub fn with_hard_deadline(mut self) -> Self {
        self.options.hard_deadline = true;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.options.weight = Some(weight.max(1));
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = Some(ttl);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.options.idempotency_key = Some(key.into());
        self
    }

    pub fn with_share_key(mut self, key: impl Into<String>) -> Self {
        self.options.share_key = Some(key.into());
        self
    }

    /// Hedge a slow attempt with a second one; the first result wins
    pub fn with_speculation(mut self, after: Duration) -> Self {
        self.options.speculate_after = Some(after);
        self
    }

    /// Route to a worker that already ran tasks with this key, when one is idle
    pub fn with_affinity(mut self, key: impl Into<String>) -> Self {
        self.options.affinity_key = Some(key.into());
        self
    }

    /// Identity used for deduplication
    pub fn dedup_key(&self) -> DedupKey {
        if let Some(key) = &self.options.idempotency_key {
            DedupKey::Idempotency(key.clone())
        } else if let Some(id) = &self.id {
            DedupKey::Id(id.clone())
        } else {
            DedupKey::fingerprint(&self.kind, &self.input)
        }
    }

    /// Freeze the submission into an immutable task, filling defaults
    pub fn into_task(self, default_ttl: Duration, default_max_attempts: u32, now: Instant) -> Task {
        let dedup_key = self.dedup_key();
        let options = self.options;
        Task {
            id: self.id.unwrap_or_else(TaskId::generate),
            kind: self.kind,
            input: self.input,
            priority: options.priority,
            deadline: options.deadline,
            hard_deadline: options.hard_deadline,
            weight: options.weight.unwrap_or(1),
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts).max(1),
            ttl: options.ttl.unwrap_or(default_ttl),
            share_key: options
                .share_key
                .unwrap_or_else(|| DEFAULT_SHARE_KEY.to_string()),
            speculate_after: options.speculate_after,
            affinity: options.affinity_key,
            dedup_key,
            submitted_at: now,
        }
    }
}

/// Immutable task record owned by the delivery protocol
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: String,
    pub input: Value,
    pub priority: i64,
    pub deadline: Option<Instant>,
    pub hard_deadline: bool,
    pub weight: u32,
    pub max_attempts: u32,
    pub ttl: Duration,
    pub share_key: String,
    /// Per-task speculation delay; the engine default applies when unset
    pub speculate_after: Option<Duration>,
    pub affinity: Option<String>,
    pub dedup_key: DedupKey,
    pub submitted_at: Instant,
}

impl Task {
    /// Whether dispatching at `now` misses the deadline
    pub fn is_late(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }
}

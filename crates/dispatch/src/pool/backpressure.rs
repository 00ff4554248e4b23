//! Admission control for submissions
//!
//! Load is the number of outstanding tasks (in flight plus buffered in the
//! reorder buffer) against a configured limit.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What `submit` does when the engine is over its high watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Fail immediately with `TaskRejected`
    Reject,

    /// Suspend the caller until capacity frees up, then `TaskRejected`
    Wait {
        #[serde(with = "crate::duration_millis")]
        timeout: Duration,
    },
}

impl Default for AdmissionMode {
    fn default() -> Self {
        Self::Reject
    }
}

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use relaykit_dispatch::{AdmissionMode, BackpressureConfig};
/// use std::time::Duration;
///
/// let config = BackpressureConfig::default()
///     .with_max_outstanding(1_000)
///     .with_low_watermark(0.75)
///     .with_admission(AdmissionMode::Wait { timeout: Duration::from_secs(2) });
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Stop admitting when load reaches this share of `max_outstanding`
    pub high_watermark: f64,

    /// Once closed, resume admitting when load falls to this share and
    /// below the high watermark. Equal to the high watermark by default, so
    /// a single free slot reopens admission; set it lower for hysteresis.
    pub low_watermark: f64,

    /// Outstanding task limit; `None` admits everything
    pub max_outstanding: Option<usize>,

    #[serde(default)]
    pub admission: AdmissionMode,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1.0,
            low_watermark: 1.0,
            max_outstanding: None,
            admission: AdmissionMode::Reject,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_outstanding(mut self, limit: usize) -> Self {
        self.max_outstanding = Some(limit);
        self
    }

    pub fn with_admission(mut self, admission: AdmissionMode) -> Self {
        self.admission = admission;
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark > self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must not exceed high_watermark".into(),
            ));
        }
        if self.max_outstanding == Some(0) {
            return Err(BackpressureError::InvalidConfig(
                "max_outstanding must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Admission state
///
/// Written by the control loop, readable from any handle. Hysteresis
/// between the watermarks keeps admission from flapping at the limit.
#[derive(Debug)]
pub struct BackpressureState {
    config: BackpressureConfig,
    outstanding: AtomicUsize,
    accepting: AtomicBool,
    rejected: AtomicU64,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            outstanding: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            rejected: AtomicU64::new(0),
            reason: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Whether one more task may be admitted
    pub fn should_accept(&self) -> bool {
        let Some(limit) = self.config.max_outstanding else {
            return true;
        };
        let load = self.outstanding.load(Ordering::Relaxed);
        let ratio = load as f64 / limit.max(1) as f64;

        if self.accepting.load(Ordering::Relaxed) {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "{} outstanding tasks reach {:.0}% of limit {}",
                    load,
                    ratio * 100.0,
                    limit
                ));
                return false;
            }
            true
        } else {
            if ratio < self.config.high_watermark && ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    /// Publish the current outstanding count
    pub fn set_outstanding(&self, outstanding: usize) {
        self.outstanding.store(outstanding, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Outstanding tasks as a share of the limit (0.0 when unbounded)
    pub fn load_ratio(&self) -> f64 {
        match self.config.max_outstanding {
            Some(limit) => self.outstanding() as f64 / limit.max(1) as f64,
            None => 0.0,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

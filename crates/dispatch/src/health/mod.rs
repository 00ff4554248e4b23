//! Worker health detection
//!
//! The control loop pings every ready worker once per health interval. Any
//! message from a worker counts as a heartbeat. A worker silent for longer
//! than the heartbeat timeout is marked unresponsive and receives no new
//! work; if it stays silent through the grace period it is force-crashed and
//! replaced, and its task goes back through the retry path.

mod monitor;

pub use monitor::{HealthMonitor, HealthVerdict, HeartbeatError};

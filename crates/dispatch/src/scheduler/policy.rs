//! Scheduling policy selection

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Order in which queued tasks are offered to idle workers
///
/// # Example
///
/// ```
/// use relaykit_dispatch::SchedulingPolicy;
///
/// let policy: SchedulingPolicy = "fair-share".parse().unwrap();
/// assert_eq!(policy, SchedulingPolicy::FairShare);
///
/// // priority with aging: +0.5 effective priority per second queued
/// let aging = SchedulingPolicy::priority_with_aging(0.5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Highest effective priority first, ties by submission order
    ///
    /// Effective priority is `priority + aging_per_sec * seconds_queued`.
    /// With zero aging, low priority work can starve under sustained load.
    Priority {
        #[serde(default)]
        aging_per_sec: f64,
    },

    /// Share key with the least cumulative assigned weight goes next
    FairShare,

    /// FIFO tasks, workers chosen by smooth weighted round-robin
    WeightedRoundRobin,

    /// Earliest deadline first, tasks without one last
    Deadline,

    /// Per-worker deques; idle workers steal from the longest peer
    WorkStealing,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self::Priority { aging_per_sec: 0.0 }
    }
}

impl SchedulingPolicy {
    pub fn priority_with_aging(aging_per_sec: f64) -> Self {
        Self::Priority {
            aging_per_sec: aging_per_sec.max(0.0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Priority { .. } => "priority",
            Self::FairShare => "fair-share",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::Deadline => "deadline",
            Self::WorkStealing => "work-stealing",
        }
    }
}

impl std::fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "priority" => Ok(Self::default()),
            "fair-share" | "fair" => Ok(Self::FairShare),
            "weighted-round-robin" | "wrr" => Ok(Self::WeightedRoundRobin),
            "deadline" | "edf" => Ok(Self::Deadline),
            "work-stealing" | "stealing" => Ok(Self::WorkStealing),
            other => Err(format!(
                "unknown scheduling policy '{}' (expected priority, fair-share, wrr, deadline, work-stealing)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("wrr".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::WeightedRoundRobin);
        assert_eq!("Work_Stealing".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::WorkStealing);
        assert!("lottery".parse::<SchedulingPolicy>().is_err());
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_value(SchedulingPolicy::priority_with_aging(2.0)).unwrap();
        assert_eq!(json["type"], "priority");
        assert_eq!(json["aging_per_sec"], 2.0);

        let parsed: SchedulingPolicy = serde_json::from_str(r#"{"type":"priority"}"#).unwrap();
        assert_eq!(parsed, SchedulingPolicy::default());
    }

    #[test]
    fn test_negative_aging_clamped() {
        assert_eq!(
            SchedulingPolicy::priority_with_aging(-1.0),
            SchedulingPolicy::Priority { aging_per_sec: 0.0 }
        );
    }
}

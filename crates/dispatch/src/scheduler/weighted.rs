//! Smooth weighted round-robin over workers

use std::collections::HashMap;

use crate::pool::WorkerId;

/// Smooth weighted round-robin
///
/// Each pick adds every candidate's weight to its counter, takes the largest
/// counter and subtracts the total weight from the winner. Weights 5:1:1
/// yield `a a b a c a a` rather than a burst of five `a`s.
#[derive(Debug, Default)]
pub(crate) struct SmoothWeighted {
    current: HashMap<WorkerId, i64>,
}

impl SmoothWeighted {
    pub fn pick(&mut self, candidates: &[(WorkerId, u32)]) -> Option<WorkerId> {
        let total: i64 = candidates.iter().map(|(_, w)| i64::from(*w)).sum();
        let mut best: Option<(WorkerId, i64)> = None;

        for (id, weight) in candidates {
            let counter = self.current.entry(*id).or_insert(0);
            *counter += i64::from(*weight);
            let better = match best {
                None => true,
                Some((best_id, best_value)) => {
                    *counter > best_value || (*counter == best_value && *id < best_id)
                }
            };
            if better {
                best = Some((*id, *counter));
            }
        }

        let (winner, _) = best?;
        if let Some(counter) = self.current.get_mut(&winner) {
            *counter -= total;
        }
        Some(winner)
    }

    pub fn forget(&mut self, id: WorkerId) {
        self.current.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smooth_distribution() {
        let a = WorkerId::new(1);
        let b = WorkerId::new(2);
        let c = WorkerId::new(3);
        let candidates = [(a, 5), (b, 1), (c, 1)];

        let mut wrr = SmoothWeighted::default();
        let picks: Vec<WorkerId> = (0..7).filter_map(|_| wrr.pick(&candidates)).collect();
        assert_eq!(picks, vec![a, a, b, a, c, a, a]);
    }

    #[test]
    fn test_equal_weights_rotate() {
        let a = WorkerId::new(1);
        let b = WorkerId::new(2);
        let mut wrr = SmoothWeighted::default();
        let picks: Vec<WorkerId> = (0..4).filter_map(|_| wrr.pick(&[(a, 1), (b, 1)])).collect();
        assert_eq!(picks, vec![a, b, a, b]);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(SmoothWeighted::default().pick(&[]).is_none());
    }
}

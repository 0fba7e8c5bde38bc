use serde::Serialize;
use std::time::Duration;

/// A change applied by [`AdaptiveInterval::observe`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalChange {
    pub previous_secs: u64,
    pub current_secs: u64,
    pub active_strategies: usize,
    pub active_executions: usize,
    pub utilization: f64,
}

/// Picks the delay until the next check cycle.
///
/// Idle deployments poll at `max`; the busier the executor pool was in the
/// last cycle, the closer the delay moves to `min`. A proposal is applied only
/// when it differs from the current delay by more than `hysteresis`.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
    hysteresis: Duration,
    current: Duration,
}

impl AdaptiveInterval {
    /// Starts at `min` so the first cycles after startup come quickly.
    pub fn new(min: Duration, max: Duration, hysteresis: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            hysteresis,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }

    pub fn propose(
        &self,
        active_strategies: usize,
        active_executions: usize,
        capacity: usize,
    ) -> Duration {
        if active_strategies == 0 || capacity == 0 {
            return self.max;
        }
        let utilization = Self::utilization(active_executions, capacity);
        let span = (self.max - self.min).as_secs_f64();
        let proposal = self.max.as_secs_f64() - span * utilization;
        Duration::from_secs(proposal.round() as u64).clamp(self.min, self.max)
    }

    /// Record the last cycle's load and maybe move the interval.
    pub fn observe(
        &mut self,
        active_strategies: usize,
        active_executions: usize,
        capacity: usize,
    ) -> Option<IntervalChange> {
        let proposal = self.propose(active_strategies, active_executions, capacity);
        let delta = if proposal > self.current {
            proposal - self.current
        } else {
            self.current - proposal
        };
        if delta <= self.hysteresis {
            return None;
        }

        let change = IntervalChange {
            previous_secs: self.current.as_secs(),
            current_secs: proposal.as_secs(),
            active_strategies,
            active_executions,
            utilization: Self::utilization(active_executions, capacity),
        };
        self.current = proposal;
        Some(change)
    }

    fn utilization(active_executions: usize, capacity: usize) -> f64 {
        if capacity == 0 {
            return 0.0;
        }
        active_executions.min(capacity) as f64 / capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn controller() -> AdaptiveInterval {
        AdaptiveInterval::new(minutes(1), minutes(15), minutes(1))
    }

    #[test]
    fn test_idle_proposes_max() {
        let interval = controller();
        assert_eq!(interval.propose(0, 0, 8), minutes(15));
    }

    #[test]
    fn test_saturated_proposes_min() {
        let interval = controller();
        assert_eq!(interval.propose(2, 8, 8), minutes(1));
        assert_eq!(interval.propose(2, 40, 8), minutes(1));
    }

    #[test]
    fn test_half_load_lands_between_bounds() {
        let interval = controller();
        assert_eq!(interval.propose(1, 4, 8), minutes(8));
    }

    #[test]
    fn test_small_changes_are_ignored() {
        let mut interval = controller();
        // Proposal is 102 s, 42 s away from the current 60 s.
        assert!(interval.observe(1, 95, 100).is_none());
        assert_eq!(interval.current(), minutes(1));
    }

    #[test]
    fn test_large_change_applied_and_reported() {
        let mut interval = controller();
        let change = interval.observe(0, 0, 8).unwrap();
        assert_eq!(change.previous_secs, 60);
        assert_eq!(change.current_secs, 900);
        assert_eq!(interval.current(), minutes(15));

        // Same load again is not a change.
        assert!(interval.observe(0, 0, 8).is_none());
    }

    #[test]
    fn test_proposals_stay_within_bounds() {
        let interval = controller();
        for executions in 0..20 {
            for strategies in 0..3 {
                let p = interval.propose(strategies, executions, 8);
                assert!(p >= minutes(1) && p <= minutes(15));
            }
        }
    }

    #[test]
    fn test_inverted_bounds_collapse_to_min() {
        let interval = AdaptiveInterval::new(minutes(5), minutes(2), Duration::ZERO);
        assert_eq!(interval.bounds(), (minutes(5), minutes(5)));
        assert_eq!(interval.propose(0, 0, 8), minutes(5));
    }
}

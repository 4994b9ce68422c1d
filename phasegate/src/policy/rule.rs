// src/policy/rule.rs
//
// Rule-based predictor: advance when the queues waiting on red exceed the
// queues being served by the current phase by more than `margin`.

use super::{validate_state, Policy};
use crate::error::PolicyError;

pub const RULE_POLICY_VERSION: &str = "queue-threshold-v1";

#[derive(Debug, Clone)]
pub struct QueueThresholdPolicy {
    num_detectors: usize,
    num_phases: usize,
    margin: f64,
}

impl QueueThresholdPolicy {
    pub fn new(num_detectors: usize, num_phases: usize) -> Self {
        Self {
            num_detectors,
            num_phases: num_phases.max(1),
            margin: 0.0,
        }
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin.max(0.0);
        self
    }

    /// (served, waiting) queue totals for the phase encoded in `state`.
    fn split(&self, state: &[f64]) -> (f64, f64) {
        let phase = state[self.num_detectors] as usize % self.num_phases;
        state[..self.num_detectors]
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(served, waiting), (i, q)| {
                if i % self.num_phases == phase {
                    (served + q, waiting)
                } else {
                    (served, waiting + q)
                }
            })
    }
}

impl Policy for QueueThresholdPolicy {
    fn version(&self) -> &str {
        RULE_POLICY_VERSION
    }

    fn state_width(&self) -> usize {
        self.num_detectors + 2
    }

    /// `[served + margin, waiting]`.
    fn scores(&self, state: &[f64]) -> Result<Vec<f64>, PolicyError> {
        validate_state(state, self.state_width())?;
        let (served, waiting) = self.split(state);
        Ok(vec![served + self.margin, waiting])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_when_red_side_is_longer() {
        let p = QueueThresholdPolicy::new(2, 2);
        assert_eq!(p.act(&[3.0, 5.0, 0.0, 12.0]).expect("act"), 1);
        assert_eq!(p.act(&[3.0, 5.0, 1.0, 12.0]).expect("act"), 0);
        assert_eq!(p.act(&[4.0, 4.0, 0.0, 0.0]).expect("act"), 0);
    }

    #[test]
    fn margin_raises_the_bar() {
        let p = QueueThresholdPolicy::new(2, 2).with_margin(3.0);
        assert_eq!(p.act(&[3.0, 5.0, 0.0, 0.0]).expect("act"), 0);
        assert_eq!(p.act(&[3.0, 7.0, 0.0, 0.0]).expect("act"), 1);
    }
}

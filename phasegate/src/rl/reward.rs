// src/rl/reward.rs
//
// Per-step reward for the trainer and the evaluator.
//
//   r = w_q * (-sum(queues)) + w_e * (-emission / kappa)
//
// Both terms are penalties, so a better-running intersection earns a reward
// closer to zero. `kappa` brings particulate emission onto the same scale as
// vehicle counts.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::StateVector;

/// Raw inputs to the reward, logged alongside every training step so the
/// scalar can be reconstructed offline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardComponents {
    /// Sum of per-detector queue lengths.
    pub total_queue: f64,
    /// Aggregate particulate emission over the configured edges.
    pub emission: f64,
}

impl RewardComponents {
    pub fn from_state(state: &StateVector) -> Self {
        Self {
            total_queue: state.total_queue() as f64,
            emission: state.emission,
        }
    }

    pub fn compute_reward(&self, weights: &RewardWeights) -> f64 {
        weights.w_queue * -self.total_queue + weights.w_emission * -(self.emission / weights.kappa)
    }
}

/// Configurable reward weights. Both weights are non-negative and `kappa`
/// is strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    /// Weight on the queue penalty.
    pub w_queue: f64,
    /// Weight on the emission penalty.
    pub w_emission: f64,
    /// Emission normalisation constant.
    pub kappa: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            w_queue: 0.6,
            w_emission: 0.4,
            kappa: 1_000.0,
        }
    }
}

impl RewardWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.w_queue.is_finite() && self.w_queue >= 0.0) {
            return Err(ConfigError::invalid(
                "trainer.reward.w_queue",
                format!("must be finite and >= 0, got {}", self.w_queue),
            ));
        }
        if !(self.w_emission.is_finite() && self.w_emission >= 0.0) {
            return Err(ConfigError::invalid(
                "trainer.reward.w_emission",
                format!("must be finite and >= 0, got {}", self.w_emission),
            ));
        }
        if !(self.kappa.is_finite() && self.kappa > 0.0) {
            return Err(ConfigError::invalid(
                "trainer.reward.kappa",
                format!("must be finite and > 0, got {}", self.kappa),
            ));
        }
        Ok(())
    }
}

/// Reward for arriving in `state`.
pub fn reward(state: &StateVector, weights: &RewardWeights) -> f64 {
    RewardComponents::from_state(state).compute_reward(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_intersection_earns_zero() {
        let s = StateVector::new(vec![0, 0], 1, 0.0);
        assert_eq!(reward(&s, &RewardWeights::default()), 0.0);
    }

    #[test]
    fn queue_only_weights_ignore_emission() {
        let w = RewardWeights {
            w_queue: 1.0,
            w_emission: 0.0,
            kappa: 1.0,
        };
        let s = StateVector::new(vec![1, 2, 3], 0, 5_000.0);
        assert!((reward(&s, &w) + 6.0).abs() < 1e-12);
    }

    #[test]
    fn longer_queues_are_worse() {
        let w = RewardWeights::default();
        let short = StateVector::new(vec![1, 1], 0, 10.0);
        let long = StateVector::new(vec![4, 4], 0, 10.0);
        assert!(reward(&long, &w) < reward(&short, &w));
    }

    #[test]
    fn validate_rejects_negative_weights_and_zero_kappa() {
        let mut w = RewardWeights::default();
        assert!(w.validate().is_ok());
        w.w_emission = -0.1;
        assert!(w.validate().is_err());
        w = RewardWeights {
            kappa: 0.0,
            ..RewardWeights::default()
        };
        assert!(w.validate().is_err());
    }
}

// src/policy/random.rs
//
// Uniform-random fallback. Seeded so degraded runs are reproducible.

use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{uniform_scores, validate_state, Policy};
use crate::error::PolicyError;
use crate::types::Action;

pub const RANDOM_POLICY_VERSION: &str = "uniform-random-v1";

pub struct RandomPolicy {
    state_width: usize,
    rng: Mutex<ChaCha8Rng>,
}

impl RandomPolicy {
    pub fn new(state_width: usize, seed: u64) -> Self {
        Self {
            state_width,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl Policy for RandomPolicy {
    fn version(&self) -> &str {
        RANDOM_POLICY_VERSION
    }

    fn state_width(&self) -> usize {
        self.state_width
    }

    fn scores(&self, state: &[f64]) -> Result<Vec<f64>, PolicyError> {
        validate_state(state, self.state_width)?;
        Ok(uniform_scores())
    }

    fn act(&self, state: &[f64]) -> Result<usize, PolicyError> {
        validate_state(state, self.state_width)?;
        let index = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..Action::COUNT),
            Err(poisoned) => poisoned.into_inner().gen_range(0..Action::COUNT),
        };
        Ok(index)
    }
}

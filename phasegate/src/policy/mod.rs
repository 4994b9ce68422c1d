// src/policy/mod.rs
//
// Policy interface and implementations.
//
// - Policy trait: state slice -> action index, plus per-action scores
// - QNetPolicy: trained action-value network loaded from a JSON artifact
// - RandomPolicy: seeded uniform sampling over the action set
// - QueueThresholdPolicy: rule-based fallback
// - PolicyHandle: the shared, reloadable handle the controller holds
//
// Policies are synchronous. Every implementation validates width and
// finiteness before doing anything else.

pub mod handle;
pub mod qnet;
pub mod random;
pub mod rule;

pub use handle::PolicyHandle;
pub use qnet::{QNetPolicy, QNetwork};
pub use random::RandomPolicy;
pub use rule::QueueThresholdPolicy;

use crate::error::PolicyError;
use crate::types::Action;

pub trait Policy: Send + Sync {
    /// Version string recorded in logs and telemetry.
    fn version(&self) -> &str;

    /// Width of the state this policy was built for.
    fn state_width(&self) -> usize;

    /// One score per action, higher is better.
    fn scores(&self, state: &[f64]) -> Result<Vec<f64>, PolicyError>;

    /// Action index for `state`. Defaults to the arg-max of `scores`,
    /// with ties going to the lower index (hold).
    fn act(&self, state: &[f64]) -> Result<usize, PolicyError> {
        let scores = self.scores(state)?;
        Ok(argmax(&scores))
    }
}

/// Reject states of the wrong width or with non-finite components.
pub fn validate_state(state: &[f64], expected: usize) -> Result<(), PolicyError> {
    if state.len() != expected {
        return Err(PolicyError::StateShapeMismatch {
            expected,
            got: state.len(),
        });
    }
    if let Some((index, &value)) = state.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(PolicyError::NonFiniteState { index, value });
    }
    Ok(())
}

pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Uniform scores over the action set.
pub fn uniform_scores() -> Vec<f64> {
    vec![1.0 / Action::COUNT as f64; Action::COUNT]
}

// src/rl/eval.rs
//
// Greedy evaluation of a policy behind the production gate, plus the
// per-episode summary shared with the trainer.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::reward::{reward, RewardWeights};
use super::telemetry::TerminationReason;
use crate::config::IntersectionConfig;
use crate::control::{GateVerdict, PhaseLock};
use crate::error::{ControlError, ErrorClass};
use crate::policy::Policy;
use crate::sim::Simulator;
use crate::types::{Action, StateVector};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: u64,
    pub steps: u64,
    pub total_reward: f64,
    /// Mean of the summed queue length over the episode's steps.
    pub mean_queue: f64,
    pub total_emission: f64,
    /// Effected phase advances.
    pub advances: u64,
    pub termination_reason: TerminationReason,
    /// Mean minibatch loss; training only.
    pub mean_loss: Option<f64>,
}

/// Running totals for one episode.
#[derive(Debug, Clone, Default)]
pub(crate) struct EpisodeStats {
    steps: u64,
    total_reward: f64,
    queue_sum: f64,
    emission_sum: f64,
    loss_sum: f64,
    updates: u64,
}

impl EpisodeStats {
    pub(crate) fn record(&mut self, next: &StateVector, r: f64) {
        self.steps += 1;
        self.total_reward += r;
        self.queue_sum += next.total_queue() as f64;
        self.emission_sum += next.emission;
    }

    pub(crate) fn record_loss(&mut self, loss: f64) {
        self.loss_sum += loss;
        self.updates += 1;
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps
    }

    pub(crate) fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub(crate) fn finish(
        self,
        episode_id: u64,
        advances: u64,
        termination_reason: TerminationReason,
    ) -> EpisodeSummary {
        let mean_queue = if self.steps == 0 {
            0.0
        } else {
            self.queue_sum / self.steps as f64
        };
        EpisodeSummary {
            episode_id,
            steps: self.steps,
            total_reward: self.total_reward,
            mean_queue,
            total_emission: self.emission_sum,
            advances,
            termination_reason,
            mean_loss: (self.updates > 0).then(|| self.loss_sum / self.updates as f64),
        }
    }
}

/// Policy action for `state`, holding on rejected states and
/// out-of-range indices.
pub(crate) fn greedy_action(policy: &dyn Policy, state: &StateVector) -> Result<Action, ControlError> {
    match policy.act(&state.features()) {
        Ok(index) => Ok(Action::from_index(index).unwrap_or(Action::Hold)),
        Err(err) if err.class() == ErrorClass::Protocol => {
            warn!(error = %err, "state rejected during evaluation; holding");
            Ok(Action::Hold)
        }
        Err(err) => Err(err.into()),
    }
}

/// Run `episodes` greedy, gate-enforced episodes of at most `max_steps`
/// ticks each (0 = until drained). The simulator is restarted for every
/// episode and closed afterwards.
pub fn evaluate<S: Simulator>(
    sim: &mut S,
    policy: &dyn Policy,
    intersection: &IntersectionConfig,
    weights: &RewardWeights,
    episodes: u32,
    max_steps: u64,
) -> Result<Vec<EpisodeSummary>, ControlError> {
    let mut out = Vec::with_capacity(episodes as usize);
    for episode_id in 0..episodes as u64 {
        let summary = run_eval_episode(sim, policy, intersection, weights, episode_id, max_steps);
        if let Err(err) = sim.close() {
            warn!(error = %err, "simulator close failed");
        }
        let summary = summary?;
        info!(
            episode_id,
            steps = summary.steps,
            total_reward = summary.total_reward,
            mean_queue = summary.mean_queue,
            advances = summary.advances,
            "evaluation episode finished"
        );
        out.push(summary);
    }
    Ok(out)
}

fn run_eval_episode<S: Simulator>(
    sim: &mut S,
    policy: &dyn Policy,
    intersection: &IntersectionConfig,
    weights: &RewardWeights,
    episode_id: u64,
    max_steps: u64,
) -> Result<EpisodeSummary, ControlError> {
    if sim.is_running() {
        sim.close()?;
    }
    sim.start()?;
    let mut lock = PhaseLock::new(
        intersection.num_phases(),
        intersection.effective_min_green_steps(),
    );
    lock.start();
    let mut stats = EpisodeStats::default();

    let reason = loop {
        if max_steps > 0 && stats.steps >= max_steps {
            break TerminationReason::MaxSteps;
        }
        if sim.remaining_vehicles()? == 0 {
            break TerminationReason::Drained;
        }
        let state = sim.read_state()?;
        let action = greedy_action(policy, &state)?;
        if let GateVerdict::Advanced { to, .. } = lock.on_tick(action) {
            sim.set_phase(to)?;
        }
        sim.step()?;
        let next = sim.read_state()?;
        stats.record(&next, reward(&next, weights));
    };
    Ok(stats.finish(episode_id, lock.advances(), reason))
}

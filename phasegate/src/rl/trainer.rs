// src/rl/trainer.rs
//
// Episodic DQN training over repeated simulator runs.
//
// Per step: epsilon-greedy action, optional minimum-green gate, simulator
// step, reward on the resulting state, replay insert, and one minibatch
// update once the ring holds `batch_size` transitions. The target network
// is a copy of the online network refreshed every `target_update_freq`
// global steps. The artifact is written once, after the last episode.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use super::eval::{EpisodeStats, EpisodeSummary};
use super::optim::Adam;
use super::replay::{ReplayBuffer, Transition};
use super::reward::RewardComponents;
use super::schedule::EpsilonSchedule;
use super::telemetry::{StepRecord, TelemetrySink, TerminationReason};
use crate::config::{IntersectionConfig, TrainerConfig};
use crate::control::{GateVerdict, PhaseLock, Shutdown};
use crate::error::{ConfigError, ControlError, PolicyError};
use crate::policy::qnet::{Gradients, QNetwork};
use crate::policy::{argmax, QNetPolicy};
use crate::sim::Simulator;
use crate::types::Action;

/// Gradient norm above which a minibatch update is rescaled.
const MAX_GRAD_NORM: f64 = 10.0;

/// Default feature scaling: queues shrink to roughly unit range, the phase
/// index passes through, and emission is brought down by two orders.
pub fn default_input_scale(num_detectors: usize) -> Vec<f64> {
    let mut scale = vec![0.05; num_detectors];
    scale.push(1.0);
    scale.push(0.01);
    scale
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub episodes: Vec<EpisodeSummary>,
    pub global_steps: u64,
    pub updates: u64,
    /// True when a shutdown cut training short.
    pub interrupted: bool,
}

pub struct Trainer<S: Simulator> {
    sim: S,
    cfg: TrainerConfig,
    num_phases: usize,
    min_green: u64,
    online: QNetwork,
    target: QNetwork,
    optim: Adam,
    replay: ReplayBuffer,
    schedule: EpsilonSchedule,
    rng: ChaCha8Rng,
    global_step: u64,
    updates: u64,
    telemetry: TelemetrySink,
}

impl<S: Simulator> Trainer<S> {
    pub fn new(
        sim: S,
        cfg: &TrainerConfig,
        intersection: &IntersectionConfig,
    ) -> Result<Self, ControlError> {
        cfg.reward.validate()?;
        if cfg.batch_size == 0 || cfg.batch_size > cfg.replay_capacity {
            return Err(ConfigError::invalid(
                "trainer.batch_size",
                format!("must be in 1..={}", cfg.replay_capacity),
            )
            .into());
        }
        let width = intersection.state_width();
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let online = QNetwork::new(
            width,
            cfg.hidden_width,
            default_input_scale(intersection.detectors.len()),
            &mut rng,
        );
        let min_green = if cfg.enforce_min_green {
            intersection.effective_min_green_steps()
        } else {
            0
        };
        Ok(Self {
            sim,
            num_phases: intersection.num_phases(),
            min_green,
            target: online.clone(),
            optim: Adam::new(&online, cfg.learning_rate),
            online,
            replay: ReplayBuffer::new(cfg.replay_capacity),
            schedule: EpsilonSchedule::new(cfg.epsilon_start, cfg.epsilon_end, cfg.epsilon_decay_steps),
            rng,
            global_step: 0,
            updates: 0,
            telemetry: TelemetrySink::from_path(cfg.log_path.as_deref()),
            cfg: cfg.clone(),
        })
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn network(&self) -> &QNetwork {
        &self.online
    }

    pub fn epsilon(&self) -> f64 {
        self.schedule.value(self.global_step)
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn simulator(&self) -> &S {
        &self.sim
    }

    pub fn into_policy(self) -> QNetPolicy {
        QNetPolicy::new(self.online)
    }

    fn choose(&mut self, features: &[f64]) -> usize {
        let eps = self.schedule.value(self.global_step);
        if self.rng.gen::<f64>() < eps {
            self.rng.gen_range(0..Action::COUNT)
        } else {
            argmax(&self.online.forward(features))
        }
    }

    fn learn(&mut self) -> Option<f64> {
        let batch = self.replay.sample(self.cfg.batch_size, &mut self.rng);
        if batch.is_empty() {
            return None;
        }
        let loss = dqn_update(&mut self.online, &self.target, &mut self.optim, &batch, self.cfg.gamma);
        self.updates += 1;
        Some(loss)
    }

    /// One episode: restart the simulator and run until it drains or the
    /// step cap is reached.
    pub fn run_episode(&mut self, episode_id: u64, shutdown: Option<&Shutdown>) -> Result<EpisodeSummary, ControlError> {
        if self.sim.is_running() {
            self.sim.close()?;
        }
        self.sim.start()?;
        self.telemetry.log_episode_start(episode_id, self.cfg.seed);

        let result = self.episode_steps(episode_id, shutdown);
        if let Err(err) = self.sim.close() {
            warn!(error = %err, "simulator close failed");
        }
        let (stats, advances, reason) = match result {
            Ok(done) => done,
            Err(err) => {
                self.telemetry
                    .log_episode_end(episode_id, self.cfg.seed, TerminationReason::Error, 0.0, 0);
                self.telemetry.flush();
                return Err(err);
            }
        };
        let total_reward = stats.total_reward();
        let summary = stats.finish(episode_id, advances, reason);
        self.telemetry
            .log_episode_end(episode_id, self.cfg.seed, reason, total_reward, summary.steps);
        self.telemetry.flush();
        info!(
            episode_id,
            steps = summary.steps,
            total_reward = summary.total_reward,
            mean_queue = summary.mean_queue,
            advances = summary.advances,
            epsilon = self.epsilon(),
            mean_loss = ?summary.mean_loss,
            "training episode finished"
        );
        Ok(summary)
    }

    fn episode_steps(
        &mut self,
        episode_id: u64,
        shutdown: Option<&Shutdown>,
    ) -> Result<(EpisodeStats, u64, TerminationReason), ControlError> {
        let mut lock = PhaseLock::new(self.num_phases, self.min_green);
        lock.start();
        let mut stats = EpisodeStats::default();
        let mut state = self.sim.read_state()?;
        let max_steps = self.cfg.max_steps_per_episode;

        let reason = loop {
            if shutdown.is_some_and(Shutdown::is_triggered) {
                break TerminationReason::Manual;
            }
            if max_steps > 0 && stats.steps() >= max_steps {
                break TerminationReason::MaxSteps;
            }
            if self.sim.remaining_vehicles()? == 0 {
                break TerminationReason::Drained;
            }

            let features = state.features();
            let epsilon = self.schedule.value(self.global_step);
            let action = self.choose(&features);
            let verdict = lock.on_tick(Action::from_index(action).unwrap_or(Action::Hold));
            if let GateVerdict::Advanced { to, .. } = verdict {
                self.sim.set_phase(to)?;
            }
            self.sim.step()?;

            let next = self.sim.read_state()?;
            let components = RewardComponents::from_state(&next);
            let r = components.compute_reward(&self.cfg.reward);
            let terminal = self.sim.remaining_vehicles()? == 0;
            let next_features = next.features();
            self.replay.push(Transition {
                state: features.clone(),
                action,
                reward: r,
                next_state: next_features,
                terminal,
            });

            let loss = self.learn();
            if let Some(l) = loss {
                stats.record_loss(l);
            }
            self.global_step += 1;
            if self.cfg.target_update_freq > 0 && self.global_step % self.cfg.target_update_freq == 0 {
                self.target = self.online.clone();
                debug!(global_step = self.global_step, "target network refreshed");
            }

            self.telemetry.log_step(&StepRecord {
                episode_id,
                step: stats.steps(),
                global_step: self.global_step,
                state: features,
                action,
                advanced: verdict.is_advance(),
                epsilon,
                reward: r,
                components,
                loss,
            });
            stats.record(&next, r);
            state = next;
        };
        Ok((stats, lock.advances(), reason))
    }

    /// Run every configured episode, then write the artifact to
    /// `artifact_out`. A shutdown stops after the current step and still
    /// writes the artifact.
    pub fn train(&mut self, shutdown: Option<&Shutdown>) -> Result<TrainingReport, ControlError> {
        info!(
            episodes = self.cfg.episodes,
            gamma = self.cfg.gamma,
            batch_size = self.cfg.batch_size,
            min_green = self.min_green,
            "training started"
        );
        let mut episodes = Vec::with_capacity(self.cfg.episodes as usize);
        let mut interrupted = false;
        for episode_id in 0..self.cfg.episodes as u64 {
            let summary = self.run_episode(episode_id, shutdown)?;
            let manual = summary.termination_reason == TerminationReason::Manual;
            episodes.push(summary);
            if manual {
                interrupted = true;
                break;
            }
        }
        let artifact = self.cfg.artifact_out.clone();
        self.save(&artifact)?;
        Ok(TrainingReport {
            episodes,
            global_steps: self.global_step,
            updates: self.updates,
            interrupted,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ControlError> {
        self.online
            .save(path)
            .map_err(|err| PolicyError::Load(format!("write {}: {err}", path.display())))?;
        info!(artifact = %path.display(), global_steps = self.global_step, "artifact written");
        Ok(())
    }
}

/// One DQN minibatch step with a Huber loss on the taken action. Returns
/// the mean loss before the update.
pub fn dqn_update(
    online: &mut QNetwork,
    target: &QNetwork,
    optim: &mut Adam,
    batch: &[&Transition],
    gamma: f64,
) -> f64 {
    let n = batch.len().max(1) as f64;
    let mut grads = Gradients::zeros_like(online);
    let mut loss = 0.0;
    for t in batch {
        let trace = online.forward_trace(&t.state);
        let bootstrap = if t.terminal {
            0.0
        } else {
            target
                .forward(&t.next_state)
                .into_iter()
                .fold(f64::NEG_INFINITY, f64::max)
        };
        let y = t.reward + gamma * bootstrap;
        let err = trace.output[t.action] - y;
        loss += if err.abs() <= 1.0 {
            0.5 * err * err
        } else {
            err.abs() - 0.5
        };
        let mut grad_out = vec![0.0; trace.output.len()];
        grad_out[t.action] = err.clamp(-1.0, 1.0) / n;
        grads.add_assign(&online.backward(&trace, &grad_out));
    }
    let norm = grads.norm();
    if norm > MAX_GRAD_NORM {
        grads.scale(MAX_GRAD_NORM / norm);
    }
    optim.step(online, &grads);
    loss / n
}

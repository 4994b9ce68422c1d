// src/rl/mod.rs
//
// Offline training and evaluation of the action-value policy.
//
// Key components:
// - reward: per-step reward from queues and emission
// - replay / schedule / optim: replay ring, epsilon decay, Adam
// - trainer: episodic DQN over any `Simulator`, writes the artifact
// - eval: greedy gate-enforced evaluation and episode summaries
// - telemetry: JSONL step, episode and decision logs
//
// Nothing here is on the production control path; the controller only
// consumes the artifact file the trainer writes.

pub mod eval;
pub mod optim;
pub mod replay;
pub mod reward;
pub mod schedule;
pub mod telemetry;
pub mod trainer;

pub use eval::{evaluate, EpisodeSummary};
pub use replay::{ReplayBuffer, Transition};
pub use reward::{reward, RewardComponents, RewardWeights};
pub use schedule::EpsilonSchedule;
pub use telemetry::{TelemetrySink, TerminationReason};
pub use trainer::{Trainer, TrainingReport};

//! Phasegate: adaptive single-intersection traffic-light control.
//!
//! The controller reads a fixed-layout state (per-detector queues, current
//! phase, particulate emission), asks a policy for {hold, advance}, and
//! applies the answer only when the minimum-green gate allows it.
//!
//! # Architecture
//!
//! - **Simulator adapter** (`sim`): session lifecycle and state reads over
//!   TraCI, plus an in-process seeded queue model with the same interface.
//! - **Broker adapter** (`broker`): NGSI-LD entity publishing, subscriptions
//!   and the `/notify` endpoint feeding a bounded drop-oldest queue.
//! - **Policy** (`policy`): trained action-value network behind a reloadable
//!   handle, with random and rule-based fallbacks.
//! - **Controller** (`control`): the phase lock, the pull loop (simulator
//!   direct) and the push loop (broker mediated).
//! - **Bridge** (`bridge`): mirrors a simulator into the broker and applies
//!   `forcePhase` commands.
//! - **Trainer** (`rl`): episodic DQN, evaluation and JSONL telemetry.
//!
//! Ambient concerns live in `config`, `error`, `logging` and `ops`.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod ops;
pub mod policy;
pub mod rl;
pub mod sim;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::Config;

pub use error::{BrokerError, ConfigError, ControlError, ErrorClass, PolicyError, SimError};

pub use types::{Action, StateVector, Tick};

pub use control::{Controller, PhaseLock, Shutdown};

pub use policy::{Policy, PolicyHandle};

pub use sim::{QueueSim, Simulator, TraciSimulator};

pub use broker::BrokerClient;

pub use ops::{ControllerMetrics, HealthState};

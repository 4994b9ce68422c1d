// src/sim/mod.rs
//
// Simulator adapter interface.
//
// - `Simulator`: the session contract used by the controller, the bridge
//   publisher and the trainer
// - `traci`: TraCI binary framing over TCP
// - `adapter`: `TraciSimulator`, the external-simulator implementation
// - `queue`: `QueueSim`, a seeded in-process intersection model
//
// Methods take `&mut self`, so one session is never driven by two callers
// at once; sharing a session across tasks means wrapping it in a mutex.

pub mod adapter;
pub mod queue;
pub mod traci;

pub use adapter::TraciSimulator;
pub use queue::{QueueSim, QueueSimConfig};

use crate::error::SimError;
use crate::types::{SimTelemetry, StateVector};

pub trait Simulator: Send {
    /// Open a session. Fails with `AlreadyRunning` when one is open.
    fn start(&mut self) -> Result<(), SimError>;

    /// Advance exactly one configured tick.
    fn step(&mut self) -> Result<(), SimError>;

    /// Fresh state from the configured detectors and edges.
    fn read_state(&mut self) -> Result<StateVector, SimError>;

    /// State plus the extra fields the publisher needs.
    fn read_telemetry(&mut self) -> Result<SimTelemetry, SimError>;

    /// Request phase `phase`; visible after the next `step`.
    fn set_phase(&mut self, phase: usize) -> Result<(), SimError>;

    /// Vehicles still expected in the network (running + pending).
    fn remaining_vehicles(&mut self) -> Result<u64, SimError>;

    /// Ids of vehicles that left the network during the last tick.
    fn arrived_vehicles(&mut self) -> Result<Vec<String>, SimError>;

    /// Tear the session down. Idempotent.
    fn close(&mut self) -> Result<(), SimError>;

    fn is_running(&self) -> bool;
}

impl<S: Simulator + ?Sized> Simulator for Box<S> {
    fn start(&mut self) -> Result<(), SimError> {
        (**self).start()
    }

    fn step(&mut self) -> Result<(), SimError> {
        (**self).step()
    }

    fn read_state(&mut self) -> Result<StateVector, SimError> {
        (**self).read_state()
    }

    fn read_telemetry(&mut self) -> Result<SimTelemetry, SimError> {
        (**self).read_telemetry()
    }

    fn set_phase(&mut self, phase: usize) -> Result<(), SimError> {
        (**self).set_phase(phase)
    }

    fn remaining_vehicles(&mut self) -> Result<u64, SimError> {
        (**self).remaining_vehicles()
    }

    fn arrived_vehicles(&mut self) -> Result<Vec<String>, SimError> {
        (**self).arrived_vehicles()
    }

    fn close(&mut self) -> Result<(), SimError> {
        (**self).close()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

// src/control/gate.rs
//
// Phase lock with the minimum-green gate.
//
// States:
//   Idle                 before start
//   InPhase { p, k }     phase p has been green for k counted ticks
//   Advancing { p -> q } an advance was effected this tick; settles into
//                        InPhase { q, 0 } at the start of the next tick
//
// Every tick is counted before the gate is consulted, so an advance
// requested on the `min_green`-th tick of a phase is accepted and two
// effected advances are always at least `min_green` ticks apart.
// Gate-blocked requests are dropped, never queued.

use crate::types::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    InPhase { phase: usize, steps: u64 },
    Advancing { from: usize, to: usize },
}

/// Outcome of one tick at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// Hold was requested.
    Held,
    /// Advance requested and effected.
    Advanced { from: usize, to: usize },
    /// Advance requested inside the minimum green; dropped.
    Blocked { steps_in_phase: u64, min_green: u64 },
}

impl GateVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateVerdict::Held => "held",
            GateVerdict::Advanced { .. } => "advanced",
            GateVerdict::Blocked { .. } => "blocked",
        }
    }

    pub fn is_advance(&self) -> bool {
        matches!(self, GateVerdict::Advanced { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PhaseLock {
    num_phases: usize,
    min_green: u64,
    state: LockState,
    ticks: u64,
    advances: u64,
}

impl PhaseLock {
    pub fn new(num_phases: usize, min_green: u64) -> Self {
        Self {
            num_phases: num_phases.max(1),
            min_green,
            state: LockState::Idle,
            ticks: 0,
            advances: 0,
        }
    }

    /// Idle -> InPhase(0, 0). Restarting resets the counters.
    pub fn start(&mut self) {
        self.start_at(0);
    }

    pub fn start_at(&mut self, phase: usize) {
        self.state = LockState::InPhase {
            phase: phase % self.num_phases,
            steps: 0,
        };
        self.ticks = 0;
        self.advances = 0;
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn min_green(&self) -> u64 {
        self.min_green
    }

    pub fn num_phases(&self) -> usize {
        self.num_phases
    }

    /// Ticks seen since start.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Effected advances since start.
    pub fn advances(&self) -> u64 {
        self.advances
    }

    /// Phase currently commanded (the target while advancing).
    pub fn current_phase(&self) -> usize {
        match self.state {
            LockState::Idle => 0,
            LockState::InPhase { phase, .. } => phase,
            LockState::Advancing { to, .. } => to,
        }
    }

    pub fn steps_in_phase(&self) -> u64 {
        match self.state {
            LockState::InPhase { steps, .. } => steps,
            _ => 0,
        }
    }

    fn next_phase(&self, phase: usize) -> usize {
        (phase + 1) % self.num_phases
    }

    /// Count one tick and run `action` through the gate.
    pub fn on_tick(&mut self, action: Action) -> GateVerdict {
        let (phase, steps) = match self.state {
            LockState::Idle => (0, 0),
            LockState::InPhase { phase, steps } => (phase, steps),
            LockState::Advancing { to, .. } => (to, 0),
        };
        let steps = steps + 1;
        self.ticks += 1;

        match action {
            Action::Hold => {
                self.state = LockState::InPhase { phase, steps };
                GateVerdict::Held
            }
            Action::Advance if steps >= self.min_green => {
                let to = self.next_phase(phase);
                self.state = LockState::Advancing { from: phase, to };
                self.advances += 1;
                GateVerdict::Advanced { from: phase, to }
            }
            Action::Advance => {
                self.state = LockState::InPhase { phase, steps };
                GateVerdict::Blocked {
                    steps_in_phase: steps,
                    min_green: self.min_green,
                }
            }
        }
    }
}

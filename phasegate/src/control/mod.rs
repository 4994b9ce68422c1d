// src/control/mod.rs
//
// Controller loop.
//
// - gate: the phase lock and its minimum-green gate
// - assembler: notified partial states -> full policy states (push mode)
// - controller: policy + gate, the pull and push loops, command sinks
// - push: push-mode wiring (subscription, notification endpoint, shutdown)
// - shutdown: the shared stop signal
//
// The controller object is the only writer of the phase lock; everything it
// needs is passed in at construction.

pub mod assembler;
pub mod controller;
pub mod gate;
pub mod push;
pub mod shutdown;

pub use assembler::{Assembled, StateAssembler};
pub use controller::{
    run_pull_loop, run_push_loop, CommandSink, Controller, Decision, LoopReport, StopReason,
};
pub use gate::{GateVerdict, LockState, PhaseLock};
pub use push::PushRuntime;
pub use shutdown::Shutdown;

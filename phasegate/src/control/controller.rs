// src/control/controller.rs
//
// The controller: policy evaluation behind the minimum-green gate, plus the
// two loops that feed it.
//
// - Pull mode: `run_pull_loop` owns the simulator session and runs
//   read -> act -> gate -> set_phase -> step per tick.
// - Push mode: `run_push_loop` consumes assembled states from the
//   notification queue and sends effected phase changes through a
//   `CommandSink` (normally the broker's `forcePhase` attribute).
//
// Operational conditions (gate-blocked or out-of-range actions) never stop a
// loop; they are counted. Config-class failures always do.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::assembler::{Assembled, StateAssembler};
use super::gate::{GateVerdict, PhaseLock};
use super::shutdown::Shutdown;
use crate::broker::{BoxFuture, BrokerClient, StateQueue};
use crate::config::IntersectionConfig;
use crate::error::{BrokerError, ControlError, ErrorClass, PolicyError};
use crate::ops::ControllerMetrics;
use crate::policy::PolicyHandle;
use crate::rl::telemetry::{now_ms, DecisionRecord, TelemetrySink};
use crate::sim::Simulator;
use crate::types::{Action, StateVector, Tick};

/// Where effected phase changes go in push mode.
pub trait CommandSink: Send + Sync {
    fn apply_phase<'a>(&'a self, tls_id: &'a str, phase: usize) -> BoxFuture<'a, Result<(), BrokerError>>;
}

impl CommandSink for BrokerClient {
    fn apply_phase<'a>(&'a self, tls_id: &'a str, phase: usize) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(self.publish_force_phase(tls_id, phase))
    }
}

/// What one tick produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub tick: Tick,
    /// None when the policy output was unusable; the tick then holds.
    pub action: Option<Action>,
    pub verdict: GateVerdict,
    /// Phase to command, present only for effected advances.
    pub command: Option<usize>,
}

pub struct Controller {
    tls_id: String,
    num_detectors: usize,
    lock: PhaseLock,
    policy: Arc<PolicyHandle>,
    metrics: ControllerMetrics,
    telemetry: TelemetrySink,
}

impl Controller {
    /// Fails when the policy was built for a different state width.
    pub fn new(
        intersection: &IntersectionConfig,
        policy: Arc<PolicyHandle>,
        metrics: ControllerMetrics,
    ) -> Result<Self, ControlError> {
        let expected = intersection.state_width();
        let got = policy.state_width();
        if expected != got {
            return Err(PolicyError::StateShapeMismatch { expected, got }.into());
        }
        let mut lock = PhaseLock::new(
            intersection.num_phases(),
            intersection.effective_min_green_steps(),
        );
        lock.start();
        Ok(Self {
            tls_id: intersection.tls_id.clone(),
            num_detectors: intersection.detectors.len(),
            lock,
            policy,
            metrics,
            telemetry: TelemetrySink::disabled(),
        })
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn tls_id(&self) -> &str {
        &self.tls_id
    }

    pub fn lock(&self) -> &PhaseLock {
        &self.lock
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    /// Evaluate the policy on `state` and run the request through the gate.
    pub fn decide(&mut self, state: &StateVector) -> Result<Decision, ControlError> {
        let features = state.features();
        let action = match self.policy.act(&features) {
            Ok(index) => match Action::from_index(index) {
                Some(a) => Some(a),
                None => {
                    self.metrics.inc_out_of_range_action();
                    debug!(tls_id = %self.tls_id, index, "out-of-range action ignored");
                    None
                }
            },
            Err(err) if err.class() == ErrorClass::Protocol => {
                self.metrics.inc_error(ErrorClass::Protocol);
                warn!(tls_id = %self.tls_id, error = %err, state = ?features, "state rejected by policy");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let verdict = self.lock.on_tick(action.unwrap_or(Action::Hold));
        let tick = self.lock.ticks();
        self.metrics.inc_tick();
        let command = match verdict {
            GateVerdict::Advanced { from, to } => {
                self.metrics.inc_advance();
                info!(tls_id = %self.tls_id, tick, from, to, "phase advance");
                Some(to)
            }
            GateVerdict::Blocked {
                steps_in_phase,
                min_green,
            } => {
                self.metrics.inc_gate_blocked();
                debug!(tls_id = %self.tls_id, tick, steps_in_phase, min_green, "advance blocked by minimum green");
                None
            }
            GateVerdict::Held => None,
        };
        self.metrics
            .set_phase(self.lock.current_phase(), self.lock.steps_in_phase());

        if self.telemetry.is_enabled() {
            self.telemetry.log_decision(&DecisionRecord {
                tls_id: self.tls_id.clone(),
                tick,
                timestamp_ms: now_ms(),
                state: features,
                action: action.map(|a| a.as_str().to_string()),
                verdict: verdict.as_str().to_string(),
                command,
                phase: self.lock.current_phase(),
                steps_in_phase: self.lock.steps_in_phase(),
                policy_version: self.policy.current().version().to_string(),
            });
        }

        Ok(Decision {
            tick,
            action,
            verdict,
            command,
        })
    }

    pub fn flush_telemetry(&mut self) {
        self.telemetry.flush();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The simulator reported no vehicles left.
    Drained,
    /// The configured tick cap was reached.
    MaxTicks,
    Shutdown,
    /// The notification queue closed.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub ticks: u64,
    pub advances: u64,
    pub reason: StopReason,
}

/// Pull mode. Starts the session if needed and closes it on every exit.
/// `max_ticks == 0` means no cap.
pub fn run_pull_loop<S: Simulator>(
    sim: &mut S,
    controller: &mut Controller,
    max_ticks: u64,
    shutdown: &Shutdown,
) -> Result<LoopReport, ControlError> {
    if !sim.is_running() {
        sim.start()?;
    }
    let result = pull_ticks(sim, controller, max_ticks, shutdown);
    controller.flush_telemetry();
    if let Err(err) = sim.close() {
        warn!(error = %err, "simulator close failed");
    }
    let report = result?;
    info!(
        tls_id = controller.tls_id(),
        ticks = report.ticks,
        advances = report.advances,
        reason = ?report.reason,
        "pull loop stopped"
    );
    Ok(report)
}

fn pull_ticks<S: Simulator>(
    sim: &mut S,
    controller: &mut Controller,
    max_ticks: u64,
    shutdown: &Shutdown,
) -> Result<LoopReport, ControlError> {
    let mut ticks = 0u64;
    let mut advances = 0u64;
    let reason = loop {
        if shutdown.is_triggered() {
            break StopReason::Shutdown;
        }
        if max_ticks > 0 && ticks >= max_ticks {
            break StopReason::MaxTicks;
        }
        if sim.remaining_vehicles()? == 0 {
            break StopReason::Drained;
        }

        match sim.read_state() {
            Ok(state) => {
                let decision = controller.decide(&state)?;
                if let Some(phase) = decision.command {
                    if shutdown.is_triggered() {
                        break StopReason::Shutdown;
                    }
                    sim.set_phase(phase)?;
                    advances += 1;
                }
            }
            Err(err) if err.class() == ErrorClass::Protocol => {
                controller.metrics().inc_error(ErrorClass::Protocol);
                warn!(error = %err, "skipping tick: unreadable state");
            }
            Err(err) => return Err(err.into()),
        }

        sim.step()?;
        ticks += 1;
    };
    Ok(LoopReport {
        ticks,
        advances,
        reason,
    })
}

/// Push mode. Returns when the queue closes or shutdown is triggered;
/// no command is sent once shutdown has been observed.
pub async fn run_push_loop(
    controller: &mut Controller,
    queue: &StateQueue,
    sink: &dyn CommandSink,
    shutdown: &Shutdown,
) -> Result<LoopReport, ControlError> {
    let mut assembler = StateAssembler::new(controller.tls_id(), controller.num_detectors);
    let mut ticks = 0u64;
    let mut advances = 0u64;

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => break StopReason::Shutdown,
            next = queue.recv() => next,
        };
        let Some(partial) = next else {
            break StopReason::Closed;
        };
        if shutdown.is_triggered() {
            break StopReason::Shutdown;
        }

        let state = match assembler.absorb(partial, controller.lock().current_phase()) {
            Assembled::Ready(state) => state,
            Assembled::Cached => continue,
            Assembled::Stale => {
                controller.metrics().inc_notification_ignored();
                continue;
            }
            Assembled::Foreign(tls) => {
                controller.metrics().inc_error(ErrorClass::Protocol);
                warn!(tls_id = controller.tls_id(), other = %tls, "notification for another intersection");
                continue;
            }
            Assembled::Invalid(reason) => {
                controller.metrics().inc_error(ErrorClass::Protocol);
                warn!(tls_id = controller.tls_id(), %reason, "unusable notification");
                continue;
            }
        };

        let decision = controller.decide(&state)?;
        ticks += 1;
        let Some(phase) = decision.command else {
            continue;
        };
        if shutdown.is_triggered() {
            break StopReason::Shutdown;
        }
        advances += 1;
        match sink.apply_phase(controller.tls_id(), phase).await {
            Ok(()) => debug!(tls_id = controller.tls_id(), phase, "phase command published"),
            Err(err) => {
                controller.metrics().inc_error(err.class());
                warn!(tls_id = controller.tls_id(), phase, error = %err, "phase command failed");
            }
        }
    };

    controller.flush_telemetry();
    info!(
        tls_id = controller.tls_id(),
        ticks,
        advances,
        reason = ?reason,
        "push loop stopped"
    );
    Ok(LoopReport {
        ticks,
        advances,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    struct Always(usize);

    impl Policy for Always {
        fn version(&self) -> &str {
            "always"
        }

        fn state_width(&self) -> usize {
            4
        }

        fn scores(&self, _state: &[f64]) -> Result<Vec<f64>, PolicyError> {
            Ok(vec![0.0, 0.0])
        }

        fn act(&self, state: &[f64]) -> Result<usize, PolicyError> {
            crate::policy::validate_state(state, 4)?;
            Ok(self.0)
        }
    }

    fn controller(action: usize, min_green: u64) -> Controller {
        let intersection = IntersectionConfig {
            min_green_steps: min_green,
            ..IntersectionConfig::default()
        };
        let handle = Arc::new(PolicyHandle::new(Arc::new(Always(action))));
        Controller::new(&intersection, handle, ControllerMetrics::new()).expect("controller")
    }

    #[test]
    fn out_of_range_action_holds_and_is_counted() {
        let mut c = controller(7, 0);
        let d = c.decide(&StateVector::new(vec![1, 1], 0, 0.0)).expect("decide");
        assert_eq!(d.action, None);
        assert_eq!(d.verdict, GateVerdict::Held);
        assert_eq!(c.metrics().errors(ErrorClass::Operational), 1);
    }

    #[test]
    fn non_finite_state_is_a_protocol_error_not_fatal() {
        let mut c = controller(1, 0);
        let d = c
            .decide(&StateVector {
                queues: vec![1, 1],
                phase: 0,
                emission: f64::NAN,
            })
            .expect("decide");
        assert_eq!(d.command, None);
        assert_eq!(c.metrics().errors(ErrorClass::Protocol), 1);
    }

    #[test]
    fn width_mismatch_is_fatal_at_construction() {
        let intersection = IntersectionConfig {
            detectors: vec!["a".into(), "b".into(), "c".into()],
            ..IntersectionConfig::default()
        };
        let handle = Arc::new(PolicyHandle::new(Arc::new(Always(1))));
        let err = Controller::new(&intersection, handle, ControllerMetrics::new());
        assert!(matches!(
            err,
            Err(ControlError::Policy(PolicyError::StateShapeMismatch {
                expected: 5,
                got: 4
            }))
        ));
    }

    #[test]
    fn commands_follow_gate_verdicts() {
        let mut c = controller(1, 2);
        let s = StateVector::new(vec![0, 0], 0, 0.0);
        let cmds: Vec<Option<usize>> = (0..5).map(|_| c.decide(&s).expect("decide").command).collect();
        assert_eq!(cmds, vec![None, Some(1), None, Some(0), None]);
        assert_eq!(c.metrics().advances(), 2);
        assert_eq!(c.metrics().gate_blocked(), 3);
    }
}

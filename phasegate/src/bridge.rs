// src/bridge.rs
//
// Push-mode producer: owns the simulator and mirrors it into the broker.
//
// Per tick:
// 1. read `forcePhase` from the intersection's TrafficLight entity and apply
//    it when it differs from the last phase applied
// 2. step the simulator
// 3. publish TrafficFlowObserved and AirQualityObserved
//
// Observation windows are anchored at a wall-clock base plus simulation
// time and never regress, even if the simulator clock does.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::broker::ngsi::{self, Observed};
use crate::broker::BrokerClient;
use crate::config::IntersectionConfig;
use crate::control::{Shutdown, StopReason};
use crate::error::{ControlError, ErrorClass};
use crate::ops::ControllerMetrics;
use crate::sim::Simulator;
use crate::types::{urn, AirQualityObserved, SimTelemetry, TrafficFlowObserved};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeTick {
    /// Phase applied from `forcePhase` this tick.
    pub forced: Option<usize>,
    /// Entities published successfully.
    pub published: u32,
    pub publish_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub ticks: u64,
    pub forced: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub reason: StopReason,
}

pub struct Bridge<S: Simulator> {
    sim: S,
    client: BrokerClient,
    tls_id: String,
    num_phases: usize,
    step_length_s: f64,
    metrics: ControllerMetrics,
    base_time: DateTime<Utc>,
    last_to: Option<DateTime<Utc>>,
    applied_phase: Option<usize>,
}

impl<S: Simulator> Bridge<S> {
    pub fn new(
        sim: S,
        client: BrokerClient,
        intersection: &IntersectionConfig,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            sim,
            client,
            tls_id: intersection.tls_id.clone(),
            num_phases: intersection.num_phases(),
            step_length_s: intersection.step_length_s,
            metrics,
            base_time: Utc::now(),
            last_to: None,
            applied_phase: None,
        }
    }

    /// Anchor for simulation time zero.
    pub fn with_base_time(mut self, base: DateTime<Utc>) -> Self {
        self.base_time = base;
        self
    }

    pub fn simulator(&self) -> &S {
        &self.sim
    }

    pub fn simulator_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    fn offset(&self, secs: f64) -> DateTime<Utc> {
        let ms = if secs.is_finite() { (secs * 1_000.0).round() as i64 } else { 0 };
        self.base_time + ChronoDuration::milliseconds(ms.max(0))
    }

    /// Non-regressing `[from, to]` window for a tick ending at `sim_time`.
    fn window(&mut self, sim_time: f64) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.offset(sim_time - self.step_length_s);
        let from = match self.last_to {
            Some(last) if last > start => last,
            _ => start,
        };
        let to = self.offset(sim_time).max(from);
        self.last_to = Some(to);
        (from, to)
    }

    async fn poll_force_phase(&mut self) -> Result<Option<usize>, ControlError> {
        let id = urn::entity_id(urn::TRAFFIC_LIGHT, &self.tls_id);
        let entity = match self.client.get_entity(&id).await {
            Ok(Some(e)) => e,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.metrics.inc_error(err.class());
                warn!(entity = %id, error = %err, "forcePhase poll failed");
                return Ok(None);
            }
        };
        let requested = match ngsi::parse_entity(&entity) {
            Ok(state) => match state.force_phase {
                Observed::Present(p) => p,
                Observed::Missing => return Ok(None),
                Observed::Malformed(raw) => {
                    self.metrics.inc_error(ErrorClass::Protocol);
                    warn!(entity = %id, payload = %raw, "malformed forcePhase");
                    return Ok(None);
                }
            },
            Err(err) => {
                self.metrics.inc_error(err.class());
                warn!(entity = %id, error = %err, "undecodable TrafficLight entity");
                return Ok(None);
            }
        };
        if requested >= self.num_phases {
            self.metrics.inc_error(ErrorClass::Protocol);
            warn!(entity = %id, requested, num_phases = self.num_phases, "forcePhase out of range");
            return Ok(None);
        }
        if self.applied_phase == Some(requested) {
            return Ok(None);
        }
        self.sim.set_phase(requested)?;
        self.applied_phase = Some(requested);
        info!(tls_id = %self.tls_id, phase = requested, "forcePhase applied");
        Ok(Some(requested))
    }

    async fn publish(&mut self, telemetry: &SimTelemetry) -> (u32, u32) {
        let (from, to) = self.window(telemetry.sim_time);
        let flow = TrafficFlowObserved {
            id: urn::entity_id(urn::TRAFFIC_FLOW, &self.tls_id),
            queues: telemetry.state.queues.clone(),
            phase: telemetry.state.phase,
            vehicle_count: telemetry.vehicle_count,
            avg_speed: telemetry.mean_speed,
            date_observed_from: from.to_rfc3339_opts(SecondsFormat::Millis, true),
            date_observed_to: to.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let air = AirQualityObserved {
            id: urn::entity_id(urn::AIR_QUALITY, &self.tls_id),
            pm25: telemetry.state.emission,
        };

        let mut ok = 0;
        let mut failed = 0;
        match self.client.publish_flow(&flow).await {
            Ok(()) => ok += 1,
            Err(err) => {
                failed += 1;
                warn!(entity = %flow.id, error = %err, "flow publish failed");
            }
        }
        match self.client.publish_air(&air).await {
            Ok(()) => ok += 1,
            Err(err) => {
                failed += 1;
                warn!(entity = %air.id, error = %err, "air quality publish failed");
            }
        }
        (ok, failed)
    }

    /// One bridge tick.
    pub async fn tick(&mut self) -> Result<BridgeTick, ControlError> {
        let forced = self.poll_force_phase().await?;
        self.sim.step()?;
        let telemetry = self.sim.read_telemetry()?;
        let (published, publish_failures) = self.publish(&telemetry).await;
        debug!(
            tls_id = %self.tls_id,
            sim_time = telemetry.sim_time,
            phase = telemetry.state.phase,
            queues = ?telemetry.state.queues,
            "bridge tick"
        );
        Ok(BridgeTick {
            forced,
            published,
            publish_failures,
        })
    }

    /// Run until the simulator drains, `max_ticks` (0 = no cap) or
    /// shutdown. The session is closed on every exit.
    pub async fn run(&mut self, max_ticks: u64, shutdown: &Shutdown) -> Result<BridgeReport, ControlError> {
        if !self.sim.is_running() {
            self.sim.start()?;
        }
        let result = self.run_ticks(max_ticks, shutdown).await;
        if let Err(err) = self.sim.close() {
            warn!(error = %err, "simulator close failed");
        }
        let report = result?;
        info!(
            tls_id = %self.tls_id,
            ticks = report.ticks,
            forced = report.forced,
            published = report.published,
            publish_failures = report.publish_failures,
            reason = ?report.reason,
            "bridge stopped"
        );
        Ok(report)
    }

    async fn run_ticks(&mut self, max_ticks: u64, shutdown: &Shutdown) -> Result<BridgeReport, ControlError> {
        let mut report = BridgeReport {
            ticks: 0,
            forced: 0,
            published: 0,
            publish_failures: 0,
            reason: StopReason::Shutdown,
        };
        report.reason = loop {
            if shutdown.is_triggered() {
                break StopReason::Shutdown;
            }
            if max_ticks > 0 && report.ticks >= max_ticks {
                break StopReason::MaxTicks;
            }
            if self.sim.remaining_vehicles()? == 0 {
                break StopReason::Drained;
            }
            let tick = self.tick().await?;
            report.ticks += 1;
            report.forced += u64::from(tick.forced.is_some());
            report.published += u64::from(tick.published);
            report.publish_failures += u64::from(tick.publish_failures);
        };
        Ok(report)
    }
}

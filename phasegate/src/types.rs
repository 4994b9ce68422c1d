// src/types.rs
//
// Core value types shared by the simulator adapter, the broker adapter,
// the policy and the controller.

use serde::{Deserialize, Serialize};

/// Simulation tick counter (one configured step length per tick).
pub type Tick = u64;

/// Discrete action over the fixed set {hold, advance}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Hold,
    Advance,
}

impl Action {
    pub const COUNT: usize = 2;

    /// Returns None for indices outside {0, 1}.
    pub fn from_index(index: usize) -> Option<Action> {
        match index {
            0 => Some(Action::Hold),
            1 => Some(Action::Advance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Hold => "hold",
            Action::Advance => "advance",
        }
    }
}

/// Fixed-layout state consumed by the policy.
///
/// Feature order is `[queue_0, .., queue_{n-1}, phase, emission]`; with two
/// detectors this is the default width of 4. The order must match what the
/// artifact was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    /// Last-step vehicle counts, one per configured area detector.
    pub queues: Vec<u32>,
    /// Current phase index (0-based).
    pub phase: usize,
    /// Aggregate particulate emission over configured edges (>= 0).
    pub emission: f64,
}

impl StateVector {
    pub fn new(queues: Vec<u32>, phase: usize, emission: f64) -> Self {
        Self {
            queues,
            phase,
            emission: clamp_non_negative(emission),
        }
    }

    /// Width of the flattened feature vector for `num_detectors` queues.
    pub fn width_for(num_detectors: usize) -> usize {
        num_detectors + 2
    }

    pub fn width(&self) -> usize {
        Self::width_for(self.queues.len())
    }

    pub fn total_queue(&self) -> u64 {
        self.queues.iter().map(|&q| q as u64).sum()
    }

    /// Flatten into the policy feature layout.
    pub fn features(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.width());
        out.extend(self.queues.iter().map(|&q| q as f64));
        out.push(self.phase as f64);
        out.push(self.emission);
        out
    }
}

/// Clamp to `>= 0`, mapping NaN and `-0.0` to `0.0`.
pub fn clamp_non_negative(v: f64) -> f64 {
    if v.is_nan() || v <= 0.0 {
        0.0
    } else {
        v
    }
}

/// One tick of simulator telemetry: the policy state plus the extra
/// fields published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimTelemetry {
    /// Simulation time in seconds at the end of the tick.
    pub sim_time: f64,
    pub state: StateVector,
    /// Vehicles currently on the configured detectors.
    pub vehicle_count: u32,
    /// Mean speed over the configured detectors (m/s, >= 0).
    pub mean_speed: f64,
}

/// Entity id helpers following `urn:ngsi-ld:<Type>:<tlsId>`.
pub mod urn {
    pub const TRAFFIC_FLOW: &str = "TrafficFlowObserved";
    pub const AIR_QUALITY: &str = "AirQualityObserved";
    pub const TRAFFIC_LIGHT: &str = "TrafficLight";

    pub fn entity_id(entity_type: &str, tls_id: &str) -> String {
        format!("urn:ngsi-ld:{entity_type}:{tls_id}")
    }

    pub fn subscription_id(tls_id: &str, purpose: &str) -> String {
        format!("urn:ngsi-ld:Subscription:{purpose}:{tls_id}")
    }

    /// Extract the `<tlsId>` suffix from an entity id of any known type.
    pub fn tls_of(entity_id: &str) -> Option<&str> {
        let rest = entity_id.strip_prefix("urn:ngsi-ld:")?;
        let (_ty, tls) = rest.split_once(':')?;
        if tls.is_empty() {
            None
        } else {
            Some(tls)
        }
    }
}

/// Traffic telemetry published on behalf of the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficFlowObserved {
    pub id: String,
    pub queues: Vec<u32>,
    pub phase: usize,
    pub vehicle_count: u32,
    /// m/s, never negative.
    pub avg_speed: f64,
    pub date_observed_from: String,
    pub date_observed_to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AirQualityObserved {
    pub id: String,
    /// Never negative.
    pub pm25: f64,
}

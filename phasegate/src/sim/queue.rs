// src/sim/queue.rs
//
// Seeded in-process intersection model.
//
// One queue per configured detector (approach). Phase `p` serves every
// approach `i` with `i % num_phases == p`. Each tick:
// - a pending phase request is applied first (one-step latency)
// - served approaches discharge up to `discharge_per_tick` vehicles
// - each approach receives an arrival with probability `arrival_rates[i]`
//   until `total_vehicles` have been generated
// Emission is proportional to queued (idling) vehicles.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::Simulator;
use crate::config::IntersectionConfig;
use crate::error::SimError;
use crate::types::{SimTelemetry, StateVector};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSimConfig {
    /// Per-approach arrival probability per tick; the last value repeats
    /// when there are more approaches than rates.
    pub arrival_rates: Vec<f64>,
    /// Vehicles generated per episode.
    pub total_vehicles: u64,
    pub discharge_per_tick: u32,
    /// Particulate per idling vehicle per tick.
    pub emission_per_queued: f64,
    /// Free-flow speed (m/s) reported when nothing is queued.
    pub free_flow_speed: f64,
    pub seed: u64,
}

impl Default for QueueSimConfig {
    fn default() -> Self {
        Self {
            arrival_rates: vec![0.35, 0.2],
            total_vehicles: 600,
            discharge_per_tick: 1,
            emission_per_queued: 2.5,
            free_flow_speed: 13.9,
            seed: 1,
        }
    }
}

impl QueueSimConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_total_vehicles(mut self, total: u64) -> Self {
        self.total_vehicles = total;
        self
    }

    fn rate(&self, approach: usize) -> f64 {
        self.arrival_rates
            .get(approach)
            .or_else(|| self.arrival_rates.last())
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default)]
struct Episode {
    tick: u64,
    phase: usize,
    pending_phase: Option<usize>,
    queues: Vec<u32>,
    generated: u64,
    next_vehicle: u64,
    /// Vehicle ids per approach, front of the queue first.
    waiting: Vec<std::collections::VecDeque<u64>>,
    arrived_last_tick: Vec<String>,
    discharged_last_tick: u32,
}

pub struct QueueSim {
    cfg: QueueSimConfig,
    intersection: IntersectionConfig,
    rng: ChaCha8Rng,
    episode: Option<Episode>,
}

impl QueueSim {
    pub fn new(cfg: QueueSimConfig, intersection: IntersectionConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        Self {
            cfg,
            intersection,
            rng,
            episode: None,
        }
    }

    pub fn config(&self) -> &QueueSimConfig {
        &self.cfg
    }

    pub fn tick(&self) -> Option<u64> {
        self.episode.as_ref().map(|e| e.tick)
    }

    fn episode(&mut self) -> Result<&mut Episode, SimError> {
        self.episode.as_mut().ok_or(SimError::NotRunning)
    }

    fn approaches(&self) -> usize {
        self.intersection.detectors.len()
    }

    fn serves(&self, phase: usize, approach: usize) -> bool {
        approach % self.intersection.num_phases().max(1) == phase
    }

    fn emission(&self, ep: &Episode) -> f64 {
        let queued: u32 = ep.queues.iter().sum();
        queued as f64 * self.cfg.emission_per_queued
    }
}

impl Simulator for QueueSim {
    fn start(&mut self) -> Result<(), SimError> {
        if self.episode.is_some() {
            return Err(SimError::AlreadyRunning);
        }
        let n = self.approaches();
        if n == 0 {
            return Err(SimError::BadConfig("no detectors configured".to_string()));
        }
        self.episode = Some(Episode {
            queues: vec![0; n],
            waiting: vec![Default::default(); n],
            ..Episode::default()
        });
        Ok(())
    }

    fn step(&mut self) -> Result<(), SimError> {
        let n = self.approaches();
        let total = self.cfg.total_vehicles;
        let discharge = self.cfg.discharge_per_tick;
        let rates: Vec<f64> = (0..n).map(|i| self.cfg.rate(i)).collect();
        let served: Vec<bool> = {
            let ep = self.episode.as_ref().ok_or(SimError::NotRunning)?;
            let phase = ep.pending_phase.unwrap_or(ep.phase);
            (0..n).map(|i| self.serves(phase, i)).collect()
        };

        let mut draws = Vec::with_capacity(n);
        for rate in &rates {
            draws.push(self.rng.gen::<f64>() < *rate);
        }

        let ep = self.episode()?;
        if let Some(p) = ep.pending_phase.take() {
            ep.phase = p;
        }
        ep.arrived_last_tick.clear();
        ep.discharged_last_tick = 0;
        for i in 0..n {
            if served[i] {
                for _ in 0..discharge {
                    match ep.waiting[i].pop_front() {
                        Some(id) => {
                            ep.arrived_last_tick.push(format!("veh{id}"));
                            ep.discharged_last_tick += 1;
                        }
                        None => break,
                    }
                }
            }
            if draws[i] && ep.generated < total {
                ep.waiting[i].push_back(ep.next_vehicle);
                ep.next_vehicle += 1;
                ep.generated += 1;
            }
            ep.queues[i] = ep.waiting[i].len() as u32;
        }
        ep.tick += 1;
        Ok(())
    }

    fn read_state(&mut self) -> Result<StateVector, SimError> {
        let ep = self.episode.as_ref().ok_or(SimError::NotRunning)?;
        Ok(StateVector::new(ep.queues.clone(), ep.phase, self.emission(ep)))
    }

    fn read_telemetry(&mut self) -> Result<SimTelemetry, SimError> {
        let state = self.read_state()?;
        let ep = self.episode.as_ref().ok_or(SimError::NotRunning)?;
        let queued: u32 = ep.queues.iter().sum();
        let moving = ep.discharged_last_tick;
        let mean_speed = if queued == 0 {
            if moving == 0 {
                0.0
            } else {
                self.cfg.free_flow_speed
            }
        } else {
            self.cfg.free_flow_speed * moving as f64 / (queued + moving) as f64
        };
        Ok(SimTelemetry {
            sim_time: ep.tick as f64 * self.intersection.step_length_s,
            vehicle_count: queued,
            mean_speed,
            state,
        })
    }

    fn set_phase(&mut self, phase: usize) -> Result<(), SimError> {
        let n = self.intersection.num_phases();
        if phase >= n {
            return Err(SimError::BadConfig(format!("phase {phase} outside 0..{n}")));
        }
        self.episode()?.pending_phase = Some(phase);
        Ok(())
    }

    fn remaining_vehicles(&mut self) -> Result<u64, SimError> {
        let total = self.cfg.total_vehicles;
        let ep = self.episode.as_ref().ok_or(SimError::NotRunning)?;
        let queued: u64 = ep.queues.iter().map(|&q| q as u64).sum();
        Ok(total.saturating_sub(ep.generated) + queued)
    }

    fn arrived_vehicles(&mut self) -> Result<Vec<String>, SimError> {
        Ok(self.episode()?.arrived_last_tick.clone())
    }

    fn close(&mut self) -> Result<(), SimError> {
        self.episode = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.episode.is_some()
    }
}

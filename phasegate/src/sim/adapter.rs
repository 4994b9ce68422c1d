// src/sim/adapter.rs
//
// `TraciSimulator`: drives an external simulator process over TraCI.
//
// `start` optionally spawns the simulator bound to a remote port, connects
// with bounded retries, checks the API handshake and verifies every
// configured detector and edge id against the simulator's own id lists.
// Unknown ids surface as `BadConfig` on the first read.

use std::collections::HashSet;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::traci::{cmd, var, TraciConnection, Value};
use super::Simulator;
use crate::config::{IntersectionConfig, SimulatorConfig};
use crate::error::SimError;
use crate::types::{clamp_non_negative, SimTelemetry, StateVector};

struct Session {
    conn: TraciConnection,
    child: Option<Child>,
    known_detectors: HashSet<String>,
    known_edges: HashSet<String>,
}

pub struct TraciSimulator {
    sim: SimulatorConfig,
    intersection: IntersectionConfig,
    session: Option<Session>,
}

impl TraciSimulator {
    pub fn new(sim: SimulatorConfig, intersection: IntersectionConfig) -> Self {
        Self {
            sim,
            intersection,
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut Session, SimError> {
        self.session.as_mut().ok_or(SimError::NotRunning)
    }

    fn resolve_port(&self) -> Result<u16, SimError> {
        if self.sim.remote_port != 0 {
            return Ok(self.sim.remote_port);
        }
        let probe = TcpListener::bind((self.sim.host.as_str(), 0))?;
        Ok(probe.local_addr()?.port())
    }

    fn spawn(&self, port: u16) -> Result<Child, SimError> {
        if !self.sim.scenario_path.exists() {
            return Err(SimError::Launch(format!(
                "scenario file {} does not exist",
                self.sim.scenario_path.display()
            )));
        }
        let mut command = Command::new(&self.sim.binary);
        command
            .arg("-c")
            .arg(&self.sim.scenario_path)
            .arg("--step-length")
            .arg(self.intersection.step_length_s.to_string())
            .arg("--remote-port")
            .arg(port.to_string())
            .args(&self.sim.extra_args)
            .stdout(Stdio::null())
            .stdin(Stdio::null());
        command
            .spawn()
            .map_err(|err| SimError::Launch(format!("{}: {err}", self.sim.binary)))
    }

    fn id_list(conn: &mut TraciConnection, domain: u8) -> Result<HashSet<String>, SimError> {
        conn.get_var(domain, var::ID_LIST, "")?
            .into_string_list()
            .map(|ids| ids.into_iter().collect())
            .ok_or_else(|| SimError::Protocol("id list is not a string list".to_string()))
    }

    fn open_session(&self, port: u16) -> Result<Session, SimError> {
        let mut conn = TraciConnection::connect(
            &self.sim.host,
            port,
            self.sim.connect_attempts,
            Duration::from_millis(self.sim.connect_backoff_ms),
        )?;
        let (api, ident) = conn.get_version()?;
        info!(api, simulator = %ident, port, "traci handshake ok");
        let known_detectors = Self::id_list(&mut conn, cmd::GET_LANEAREA_VARIABLE)?;
        let known_edges = Self::id_list(&mut conn, cmd::GET_EDGE_VARIABLE)?;
        Ok(Session {
            conn,
            child: None,
            known_detectors,
            known_edges,
        })
    }

    fn check_ids(&self, session: &Session) -> Result<(), SimError> {
        if let Some(missing) = self
            .intersection
            .detectors
            .iter()
            .find(|d| !session.known_detectors.contains(*d))
        {
            return Err(SimError::BadConfig(format!("unknown area detector {missing:?}")));
        }
        if let Some(missing) = self
            .intersection
            .edges
            .iter()
            .find(|e| !session.known_edges.contains(*e))
        {
            return Err(SimError::BadConfig(format!("unknown edge {missing:?}")));
        }
        Ok(())
    }

    fn read_f64(conn: &mut TraciConnection, domain: u8, variable: u8, id: &str) -> Result<f64, SimError> {
        conn.get_var(domain, variable, id)?.as_f64().ok_or_else(|| {
            SimError::Protocol(format!("0x{domain:02x}/0x{variable:02x} {id} is not numeric"))
        })
    }

    fn read_int(conn: &mut TraciConnection, domain: u8, variable: u8, id: &str) -> Result<i64, SimError> {
        conn.get_var(domain, variable, id)?.as_i64().ok_or_else(|| {
            SimError::Protocol(format!("0x{domain:02x}/0x{variable:02x} {id} is not an integer"))
        })
    }

    fn reap(child: &mut Child) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
            }
        }
    }
}

impl Simulator for TraciSimulator {
    fn start(&mut self) -> Result<(), SimError> {
        if self.session.is_some() {
            return Err(SimError::AlreadyRunning);
        }
        let port = self.resolve_port()?;
        let mut child = if self.sim.launch {
            Some(self.spawn(port)?)
        } else {
            None
        };
        let session = match self.open_session(port) {
            Ok(s) => s,
            Err(err) => {
                if let Some(c) = child.as_mut() {
                    let _ = c.kill();
                    let _ = c.wait();
                }
                return Err(match err {
                    SimError::Io(io) => SimError::Protocol(format!("handshake failed: {io}")),
                    other => other,
                });
            }
        };
        let session = Session { child, ..session };
        if let Err(err) = self.check_ids(&session) {
            warn!(error = %err, "configured ids not present in scenario; reads will fail");
        }
        info!(
            tls_id = %self.intersection.tls_id,
            detectors = ?self.intersection.detectors,
            "simulator session open"
        );
        self.session = Some(session);
        Ok(())
    }

    fn step(&mut self) -> Result<(), SimError> {
        self.session()?.conn.simulation_step(0.0)
    }

    fn read_state(&mut self) -> Result<StateVector, SimError> {
        let detectors = self.intersection.detectors.clone();
        let edges = self.intersection.edges.clone();
        let tls_id = self.intersection.tls_id.clone();
        let session = self.session()?;

        let mut queues = Vec::with_capacity(detectors.len());
        for det in &detectors {
            if !session.known_detectors.contains(det) {
                return Err(SimError::BadConfig(format!("unknown area detector {det:?}")));
            }
            let n = Self::read_int(
                &mut session.conn,
                cmd::GET_LANEAREA_VARIABLE,
                var::LAST_STEP_VEHICLE_NUMBER,
                det,
            )?;
            queues.push(n.max(0) as u32);
        }

        let mut emission = 0.0;
        for edge in &edges {
            if !session.known_edges.contains(edge) {
                return Err(SimError::BadConfig(format!("unknown edge {edge:?}")));
            }
            emission += clamp_non_negative(Self::read_f64(
                &mut session.conn,
                cmd::GET_EDGE_VARIABLE,
                var::PMX_EMISSION,
                edge,
            )?);
        }

        let phase = Self::read_int(
            &mut session.conn,
            cmd::GET_TL_VARIABLE,
            var::TL_CURRENT_PHASE,
            &tls_id,
        )?;
        Ok(StateVector::new(queues, phase.max(0) as usize, emission))
    }

    fn read_telemetry(&mut self) -> Result<SimTelemetry, SimError> {
        let state = self.read_state()?;
        let detectors = self.intersection.detectors.clone();
        let session = self.session()?;

        let mut speed_sum = 0.0;
        let mut speed_n = 0usize;
        for (det, &count) in detectors.iter().zip(state.queues.iter()) {
            if count == 0 {
                continue;
            }
            let speed = Self::read_f64(
                &mut session.conn,
                cmd::GET_LANEAREA_VARIABLE,
                var::LAST_STEP_MEAN_SPEED,
                det,
            )?;
            speed_sum += clamp_non_negative(speed);
            speed_n += 1;
        }
        let mean_speed = if speed_n == 0 {
            0.0
        } else {
            speed_sum / speed_n as f64
        };
        let sim_time = Self::read_f64(&mut session.conn, cmd::GET_SIM_VARIABLE, var::TIME, "")?;
        let vehicle_count = state.queues.iter().sum();
        Ok(SimTelemetry {
            sim_time,
            state,
            vehicle_count,
            mean_speed,
        })
    }

    fn set_phase(&mut self, phase: usize) -> Result<(), SimError> {
        let n = self.intersection.num_phases();
        if phase >= n {
            return Err(SimError::BadConfig(format!(
                "phase {phase} outside 0..{n}"
            )));
        }
        let tls_id = self.intersection.tls_id.clone();
        self.session()?.conn.set_var(
            cmd::SET_TL_VARIABLE,
            var::TL_PHASE_INDEX,
            &tls_id,
            &Value::Int(phase as i32),
        )
    }

    fn remaining_vehicles(&mut self) -> Result<u64, SimError> {
        let session = self.session()?;
        let n = Self::read_int(
            &mut session.conn,
            cmd::GET_SIM_VARIABLE,
            var::MIN_EXPECTED_VEHICLES,
            "",
        )?;
        Ok(n.max(0) as u64)
    }

    fn arrived_vehicles(&mut self) -> Result<Vec<String>, SimError> {
        self.session()?
            .conn
            .get_var(cmd::GET_SIM_VARIABLE, var::ARRIVED_VEHICLES_IDS, "")?
            .into_string_list()
            .ok_or_else(|| SimError::Protocol("arrived ids is not a string list".to_string()))
    }

    fn close(&mut self) -> Result<(), SimError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let result = session.conn.close();
        if let Err(err) = &result {
            warn!(error = %err, "simulator close command failed");
        }
        if let Some(child) = session.child.as_mut() {
            Self::reap(child);
        }
        info!(tls_id = %self.intersection.tls_id, "simulator session closed");
        result
    }

    fn is_running(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for TraciSimulator {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

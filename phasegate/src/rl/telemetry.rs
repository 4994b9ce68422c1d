// src/rl/telemetry.rs
//
// JSONL telemetry for training steps, episode boundaries and controller
// decisions.
//
// Every line is one self-describing JSON object tagged by `kind`:
// - "episode": start/end marker (end carries termination reason and totals)
// - "step":    one trainer transition with reward components
// - "decision": one controller tick (state, action, gate verdict, phase)
//
// The sink is best-effort: a failed write disables it rather than failing
// the loop that owns it.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{self, Value as JsonValue};
use tracing::warn;

use super::reward::RewardComponents;

/// Why an episode stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The simulator reported no vehicles left.
    Drained,
    /// The per-episode step cap was reached.
    MaxSteps,
    /// A shutdown was requested.
    Manual,
    /// A simulator or policy error ended the episode.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeMarkerType {
    Start,
    End,
}

/// Episode boundary marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMarker {
    pub episode_id: u64,
    pub seed: u64,
    pub marker_type: EpisodeMarkerType,
    pub timestamp_ms: i64,
    pub termination_reason: Option<TerminationReason>,
    pub total_reward: Option<f64>,
    pub total_steps: Option<u64>,
}

/// One trainer transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub episode_id: u64,
    pub step: u64,
    pub global_step: u64,
    /// Features the action was chosen from.
    pub state: Vec<f64>,
    /// Action index requested by the learner.
    pub action: usize,
    /// Whether the phase actually changed this step.
    pub advanced: bool,
    pub epsilon: f64,
    pub reward: f64,
    pub components: RewardComponents,
    /// Minibatch loss when an update ran on this step.
    pub loss: Option<f64>,
}

/// One controller decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub tls_id: String,
    pub tick: u64,
    pub timestamp_ms: i64,
    pub state: Vec<f64>,
    /// Action requested by the policy; None when it was out of range or
    /// the state was rejected.
    pub action: Option<String>,
    /// "held", "advanced" or "blocked".
    pub verdict: String,
    /// Phase commanded this tick, if any.
    pub command: Option<usize>,
    pub phase: usize,
    pub steps_in_phase: u64,
    pub policy_version: String,
}

pub struct TelemetrySink {
    enabled: bool,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TelemetrySink {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: None,
            writer: None,
        }
    }

    /// Append to `path`, creating parent directories on first write.
    pub fn enable(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: Some(path.into()),
            writer: None,
        }
    }

    /// Enabled when `path` is set.
    pub fn from_path(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::enable(p),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if !self.enabled {
            return None;
        }

        if self.writer.is_none() {
            let path = self.path.as_ref()?;

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "telemetry disabled: cannot open log");
                    self.enabled = false;
                    return None;
                }
            };

            self.writer = Some(BufWriter::new(file));
        }

        self.writer.as_mut()
    }

    fn write_json(&mut self, kind: &str, value: JsonValue) {
        let mut value = value;
        if let JsonValue::Object(map) = &mut value {
            map.insert("kind".to_string(), JsonValue::String(kind.to_string()));
        }

        let Some(writer) = self.ensure_writer() else {
            return;
        };

        let line = match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(_) => return,
        };

        if let Err(err) = writeln!(writer, "{}", line) {
            warn!(error = %err, "telemetry disabled: write failed");
            self.enabled = false;
            self.writer = None;
        }
    }

    pub fn log_episode_start(&mut self, episode_id: u64, seed: u64) {
        let marker = EpisodeMarker {
            episode_id,
            seed,
            marker_type: EpisodeMarkerType::Start,
            timestamp_ms: now_ms(),
            termination_reason: None,
            total_reward: None,
            total_steps: None,
        };
        let value = serde_json::to_value(&marker).unwrap_or_default();
        self.write_json("episode", value);
    }

    pub fn log_episode_end(
        &mut self,
        episode_id: u64,
        seed: u64,
        reason: TerminationReason,
        total_reward: f64,
        total_steps: u64,
    ) {
        let marker = EpisodeMarker {
            episode_id,
            seed,
            marker_type: EpisodeMarkerType::End,
            timestamp_ms: now_ms(),
            termination_reason: Some(reason),
            total_reward: Some(total_reward),
            total_steps: Some(total_steps),
        };
        let value = serde_json::to_value(&marker).unwrap_or_default();
        self.write_json("episode", value);
    }

    pub fn log_step(&mut self, record: &StepRecord) {
        if !self.enabled {
            return;
        }
        let value = serde_json::to_value(record).unwrap_or_default();
        self.write_json("step", value);
    }

    pub fn log_decision(&mut self, record: &DecisionRecord) {
        if !self.enabled {
            return;
        }
        let value = serde_json::to_value(record).unwrap_or_default();
        self.write_json("decision", value);
    }

    pub fn flush(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

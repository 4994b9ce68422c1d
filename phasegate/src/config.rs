// src/config.rs
//
// Central configuration for the controller, the adapters and the trainer.
//
// Resolution order (lowest to highest precedence):
// 1. `Config::default()`
// 2. Optional YAML file (`Config::from_yaml_file`)
// 3. `PHASEGATE_*` environment overrides (`apply_env_overrides`)
// 4. CLI flags, applied by the binaries
//
// Every subsystem receives the section it needs; nothing reads ambient
// globals after startup.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::rl::reward::RewardWeights;
use crate::types::StateVector;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub intersection: IntersectionConfig,
    pub simulator: SimulatorConfig,
    pub broker: BrokerConfig,
    pub policy: PolicyConfig,
    pub trainer: TrainerConfig,
    pub ops: OpsConfig,
}

/// Immutable description of the controlled intersection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntersectionConfig {
    /// Traffic-light system id in the simulator and in entity URNs.
    pub tls_id: String,
    /// Ordered phase indices; must be exactly `0..n` with `n >= 2`.
    pub phases: Vec<usize>,
    /// Area-detector ids used as queue sensors, in state order.
    pub detectors: Vec<String>,
    /// Edge ids summed for particulate emission.
    pub edges: Vec<String>,
    /// Simulation step length in seconds.
    pub step_length_s: f64,
    /// Minimum green, in ticks.
    pub min_green_steps: u64,
    /// Minimum green in seconds; when set it overrides `min_green_steps`.
    pub min_green_s: Option<f64>,
}

impl Default for IntersectionConfig {
    fn default() -> Self {
        Self {
            tls_id: "J1".to_string(),
            phases: vec![0, 1],
            detectors: vec!["det_ns".to_string(), "det_ew".to_string()],
            edges: vec!["edge_ns".to_string(), "edge_ew".to_string()],
            step_length_s: 1.0,
            min_green_steps: 10,
            min_green_s: None,
        }
    }
}

impl IntersectionConfig {
    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn state_width(&self) -> usize {
        StateVector::width_for(self.detectors.len())
    }

    /// Minimum green expressed in ticks.
    pub fn effective_min_green_steps(&self) -> u64 {
        match self.min_green_s {
            Some(secs) if self.step_length_s > 0.0 => (secs / self.step_length_s).ceil() as u64,
            _ => self.min_green_steps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Spawn `binary`; when false, attach to a simulator already listening
    /// on `host:remote_port`.
    pub launch: bool,
    /// Simulator binary to launch.
    pub binary: String,
    /// Scenario (`.sumocfg`) file.
    pub scenario_path: PathBuf,
    pub host: String,
    pub remote_port: u16,
    /// Connection attempts while the simulator starts listening.
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    /// Hard cap on ticks per run; 0 means no cap.
    pub max_steps: u64,
    /// Extra command-line flags passed through to the simulator.
    pub extra_args: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            launch: true,
            binary: "sumo".to_string(),
            scenario_path: PathBuf::from("scenario/intersection.sumocfg"),
            host: "127.0.0.1".to_string(),
            remote_port: 8813,
            connect_attempts: 20,
            connect_backoff_ms: 250,
            max_steps: 0,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Base URL including the API prefix, e.g. `http://orion:1026/ngsi-ld/v1`.
    pub url: String,
    /// Host the broker uses to reach our notification endpoint.
    pub notify_host: String,
    /// Local bind address for the notification endpoint.
    pub notify_bind: String,
    pub notify_port: u16,
    pub request_timeout_ms: u64,
    /// Total tries per request (first attempt included).
    pub max_tries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long subscription registration keeps retrying at startup.
    pub startup_deadline_s: u64,
    /// How long notifications are accepted-and-ignored after shutdown.
    pub shutdown_grace_ms: u64,
    /// Capacity of the notification -> controller queue.
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:1026/ngsi-ld/v1".to_string(),
            notify_host: "localhost".to_string(),
            notify_bind: "0.0.0.0".to_string(),
            notify_port: 8090,
            request_timeout_ms: 5_000,
            max_tries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            startup_deadline_s: 30,
            shutdown_grace_ms: 2_000,
            queue_capacity: 16,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_s)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn notify_uri(&self) -> String {
        format!("http://{}:{}/notify", self.notify_host, self.notify_port)
    }
}

/// Which predictor stands in when the artifact cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackKind {
    Random,
    Rule,
}

impl FallbackKind {
    pub fn parse(s: &str) -> Option<FallbackKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" | "uniform" => Some(FallbackKind::Random),
            "rule" | "threshold" => Some(FallbackKind::Rule),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackKind::Random => "random",
            FallbackKind::Rule => "rule",
        }
    }
}

impl FromStr for FallbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FallbackKind::parse(s).ok_or_else(|| format!("unknown fallback kind {s:?}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub artifact_path: Option<PathBuf>,
    /// Degrade to the fallback predictor instead of failing when the
    /// artifact is absent or unreadable.
    pub random_fallback: bool,
    pub fallback: FallbackKind,
    /// Seed for the random fallback.
    pub seed: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            artifact_path: Some(PathBuf::from("models/phasegate_dqn.json")),
            random_fallback: true,
            fallback: FallbackKind::Random,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub episodes: u32,
    pub max_steps_per_episode: u64,
    pub gamma: f64,
    pub epsilon_start: f64,
    pub epsilon_end: f64,
    pub epsilon_decay_steps: u64,
    pub batch_size: usize,
    pub replay_capacity: usize,
    pub target_update_freq: u64,
    pub learning_rate: f64,
    pub hidden_width: usize,
    pub reward: RewardWeights,
    /// Apply the minimum-green gate to exploratory actions too.
    pub enforce_min_green: bool,
    pub seed: u64,
    /// Optional JSONL step log.
    pub log_path: Option<PathBuf>,
    pub artifact_out: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            episodes: 100,
            max_steps_per_episode: 3_600,
            gamma: 0.99,
            epsilon_start: 1.0,
            epsilon_end: 0.05,
            epsilon_decay_steps: 10_000,
            batch_size: 32,
            replay_capacity: 50_000,
            target_update_freq: 500,
            learning_rate: 1e-3,
            hidden_width: 24,
            reward: RewardWeights::default(),
            enforce_min_green: true,
            seed: 42,
            log_path: None,
            artifact_out: PathBuf::from("models/phasegate_dqn.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    /// Listen address for `/metrics`, `/health`, `/ready`; None disables it.
    pub metrics_addr: Option<String>,
    /// Optional JSONL log of every controller decision.
    pub decision_log: Option<PathBuf>,
}

// --- Loading + env overrides -------------------------------------------------

impl Config {
    /// Load a YAML file on top of the defaults; missing keys keep defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::File {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|err| match err {
            ConfigError::File { reason, .. } => ConfigError::File {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|err| ConfigError::File {
            path: "<inline>".to_string(),
            reason: err.to_string(),
        })
    }

    /// Defaults, then the optional file, then process env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => Config::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Apply `PHASEGATE_*` overrides read through `lookup`.
    ///
    /// Any variable that fails to parse is ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let i = &mut self.intersection;
        env_string(&lookup, "PHASEGATE_TLS_ID", &mut i.tls_id);
        if let Some(n) = env_parse::<usize, _>(&lookup, "PHASEGATE_NUM_PHASES") {
            i.phases = (0..n).collect();
        }
        env_override(&lookup, "PHASEGATE_MIN_GREEN_STEPS", &mut i.min_green_steps);
        env_override(&lookup, "PHASEGATE_STEP_LENGTH", &mut i.step_length_s);
        env_list(&lookup, "PHASEGATE_DETECTORS", &mut i.detectors);
        env_list(&lookup, "PHASEGATE_EDGES", &mut i.edges);

        let s = &mut self.simulator;
        env_string(&lookup, "PHASEGATE_SIM_BINARY", &mut s.binary);
        if let Some(raw) = lookup("PHASEGATE_SCENARIO") {
            s.scenario_path = PathBuf::from(raw);
        }
        env_override(&lookup, "PHASEGATE_SIM_PORT", &mut s.remote_port);
        env_override(&lookup, "PHASEGATE_SIM_LAUNCH", &mut s.launch);
        env_override(&lookup, "PHASEGATE_SIM_MAX_STEPS", &mut s.max_steps);

        let b = &mut self.broker;
        env_string(&lookup, "PHASEGATE_BROKER_URL", &mut b.url);
        env_string(&lookup, "PHASEGATE_NOTIFY_HOST", &mut b.notify_host);
        env_override(&lookup, "PHASEGATE_NOTIFY_PORT", &mut b.notify_port);
        env_override(&lookup, "PHASEGATE_BROKER_TIMEOUT_MS", &mut b.request_timeout_ms);
        env_override(&lookup, "PHASEGATE_BROKER_MAX_TRIES", &mut b.max_tries);
        env_override(&lookup, "PHASEGATE_STARTUP_DEADLINE_S", &mut b.startup_deadline_s);

        let p = &mut self.policy;
        if let Some(raw) = lookup("PHASEGATE_ARTIFACT") {
            p.artifact_path = if raw.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(raw))
            };
        }
        env_override(&lookup, "PHASEGATE_RANDOM_FALLBACK", &mut p.random_fallback);
        env_override(&lookup, "PHASEGATE_FALLBACK_KIND", &mut p.fallback);
        env_override(&lookup, "PHASEGATE_POLICY_SEED", &mut p.seed);

        let t = &mut self.trainer;
        env_override(&lookup, "PHASEGATE_EPISODES", &mut t.episodes);
        env_override(&lookup, "PHASEGATE_GAMMA", &mut t.gamma);
        env_override(&lookup, "PHASEGATE_EPSILON_START", &mut t.epsilon_start);
        env_override(&lookup, "PHASEGATE_EPSILON_END", &mut t.epsilon_end);
        env_override(&lookup, "PHASEGATE_EPSILON_DECAY_STEPS", &mut t.epsilon_decay_steps);
        env_override(&lookup, "PHASEGATE_BATCH_SIZE", &mut t.batch_size);
        env_override(&lookup, "PHASEGATE_REPLAY_CAPACITY", &mut t.replay_capacity);
        env_override(&lookup, "PHASEGATE_TARGET_UPDATE_FREQ", &mut t.target_update_freq);
        env_override(&lookup, "PHASEGATE_LEARNING_RATE", &mut t.learning_rate);
        env_override(&lookup, "PHASEGATE_REWARD_W_QUEUE", &mut t.reward.w_queue);
        env_override(&lookup, "PHASEGATE_REWARD_W_EMISSION", &mut t.reward.w_emission);
        env_override(&lookup, "PHASEGATE_REWARD_KAPPA", &mut t.reward.kappa);

        if let Some(raw) = lookup("PHASEGATE_METRICS_ADDR") {
            self.ops.metrics_addr = Some(raw).filter(|s| !s.trim().is_empty());
        }
        if let Some(raw) = lookup("PHASEGATE_DECISION_LOG") {
            self.ops.decision_log = Some(raw)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from);
        }
        if let Some(raw) = lookup("PHASEGATE_TRAIN_LOG") {
            self.trainer.log_path = Some(raw)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from);
        }
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let i = &self.intersection;
        if i.tls_id.trim().is_empty() {
            return Err(ConfigError::invalid("intersection.tls_id", "empty"));
        }
        if i.phases.len() < 2 {
            return Err(ConfigError::invalid(
                "intersection.phases",
                format!("need at least 2 phases, got {}", i.phases.len()),
            ));
        }
        if i.phases.iter().enumerate().any(|(idx, &p)| idx != p) {
            return Err(ConfigError::invalid(
                "intersection.phases",
                format!("phases must be 0..n in order, got {:?}", i.phases),
            ));
        }
        if i.detectors.is_empty() {
            return Err(ConfigError::invalid("intersection.detectors", "empty"));
        }
        if !(i.step_length_s > 0.0) {
            return Err(ConfigError::invalid(
                "intersection.step_length_s",
                format!("must be > 0, got {}", i.step_length_s),
            ));
        }
        self.trainer.reward.validate()?;
        let t = &self.trainer;
        if t.batch_size == 0 || t.batch_size > t.replay_capacity {
            return Err(ConfigError::invalid(
                "trainer.batch_size",
                format!(
                    "must be in 1..={} (replay capacity), got {}",
                    t.replay_capacity, t.batch_size
                ),
            ));
        }
        if !(0.0..=1.0).contains(&t.gamma) {
            return Err(ConfigError::invalid("trainer.gamma", "must be in [0, 1]"));
        }
        if self.broker.queue_capacity == 0 {
            return Err(ConfigError::invalid("broker.queue_capacity", "must be > 0"));
        }
        Ok(())
    }

    /// Single startup line summarising the effective config.
    pub fn log_startup(&self, mode: &str) {
        info!(
            mode,
            tls_id = %self.intersection.tls_id,
            num_phases = self.intersection.num_phases(),
            min_green_steps = self.intersection.effective_min_green_steps(),
            detectors = ?self.intersection.detectors,
            broker = %self.broker.url,
            artifact = ?self.policy.artifact_path,
            fallback = self.policy.fallback.as_str(),
            "phasegate config resolved"
        );
    }
}

fn env_parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "could not parse env override; ignoring");
            None
        }
    }
}

fn env_override<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = env_parse::<T, F>(lookup, key) {
        info!(key, value = ?v, "env override applied");
        *slot = v;
    }
}

fn env_string<F>(lookup: &F, key: &str, slot: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        if !raw.trim().is_empty() {
            *slot = raw.trim().to_string();
        }
    }
}

fn env_list<F>(lookup: &F, key: &str, slot: &mut Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        let items: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !items.is_empty() {
            *slot = items;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.intersection.state_width(), 4);
        assert_eq!(cfg.broker.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.broker.max_tries, 3);
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(lookup_from(&[
            ("PHASEGATE_TLS_ID", "gneJ7"),
            ("PHASEGATE_NUM_PHASES", "4"),
            ("PHASEGATE_MIN_GREEN_STEPS", "not-a-number"),
            ("PHASEGATE_DETECTORS", "d0, d1 ,d2"),
            ("PHASEGATE_FALLBACK_KIND", "rule"),
            ("PHASEGATE_ARTIFACT", ""),
        ]));
        assert_eq!(cfg.intersection.tls_id, "gneJ7");
        assert_eq!(cfg.intersection.phases, vec![0, 1, 2, 3]);
        assert_eq!(cfg.intersection.min_green_steps, 10);
        assert_eq!(cfg.intersection.detectors, vec!["d0", "d1", "d2"]);
        assert_eq!(cfg.intersection.state_width(), 5);
        assert_eq!(cfg.policy.fallback, FallbackKind::Rule);
        assert!(cfg.policy.artifact_path.is_none());
    }

    #[test]
    fn yaml_partial_file_keeps_defaults() {
        let cfg = Config::from_yaml_str(
            "intersection:\n  tls_id: X9\n  min_green_s: 15\n  step_length_s: 0.5\n",
        )
        .expect("parse yaml");
        assert_eq!(cfg.intersection.tls_id, "X9");
        assert_eq!(cfg.intersection.effective_min_green_steps(), 30);
        assert_eq!(cfg.broker.max_tries, 3);
    }

    #[test]
    fn validate_rejects_bad_phases_and_batch() {
        let mut cfg = Config::default();
        cfg.intersection.phases = vec![0];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "intersection.phases",
                ..
            })
        ));

        let mut cfg = Config::default();
        cfg.intersection.phases = vec![1, 0];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.trainer.batch_size = cfg.trainer.replay_capacity + 1;
        assert!(cfg.validate().is_err());
    }
}

// tests/trainer_tests.rs
//
// Train on the queue simulator, hand the artifact to the controller's
// policy loader, and evaluate it.

use std::fs;
use std::path::Path;

use serde_json::Value;

use phasegate::config::{IntersectionConfig, PolicyConfig, TrainerConfig};
use phasegate::control::Shutdown;
use phasegate::error::PolicyError;
use phasegate::policy::{Policy, PolicyHandle, QNetPolicy};
use phasegate::rl::{evaluate, TerminationReason, Trainer};
use phasegate::sim::{QueueSim, QueueSimConfig};

fn quick(dir: &Path) -> TrainerConfig {
    TrainerConfig {
        episodes: 2,
        max_steps_per_episode: 120,
        batch_size: 8,
        replay_capacity: 256,
        target_update_freq: 25,
        epsilon_decay_steps: 150,
        hidden_width: 8,
        seed: 11,
        log_path: Some(dir.join("logs").join("train.jsonl")),
        artifact_out: dir.join("models").join("q.json"),
        ..TrainerConfig::default()
    }
}

fn sim(intersection: &IntersectionConfig) -> QueueSim {
    QueueSim::new(QueueSimConfig::default(), intersection.clone())
}

fn kinds(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("log file")
        .lines()
        .map(|l| serde_json::from_str(l).expect("jsonl line"))
        .collect()
}

#[test]
fn trained_artifact_drives_the_controller_and_evaluation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let intersection = IntersectionConfig::default();
    let cfg = quick(dir.path());

    let mut trainer = Trainer::new(sim(&intersection), &cfg, &intersection).expect("trainer");
    let report = trainer.train(None).expect("train");
    assert_eq!(report.episodes.len(), 2);
    assert!(!report.interrupted);
    assert!(report.updates > 0);
    assert!(cfg.artifact_out.exists());
    assert!(trainer.replay_len() > 0);
    assert!(trainer.replay_len() <= cfg.replay_capacity);

    let in_memory = trainer.into_policy();
    let handle = PolicyHandle::load(
        &PolicyConfig {
            artifact_path: Some(cfg.artifact_out.clone()),
            random_fallback: false,
            ..PolicyConfig::default()
        },
        intersection.detectors.len(),
        intersection.num_phases(),
    )
    .expect("artifact loads");
    assert!(!handle.is_fallback());
    assert_eq!(handle.state_width(), intersection.state_width());

    let policy = QNetPolicy::load(&cfg.artifact_out).expect("artifact");
    let probe = vec![0.5; intersection.state_width()];
    let live = in_memory.scores(&probe).expect("scores");
    let loaded = policy.scores(&probe).expect("scores");
    for (a, b) in live.iter().zip(&loaded) {
        assert!((a - b).abs() < 1e-9);
    }
    let mut eval_sim = sim(&intersection);
    let summaries = evaluate(
        &mut eval_sim,
        &policy,
        &intersection,
        &cfg.reward,
        2,
        100,
    )
    .expect("evaluate");
    assert_eq!(summaries.len(), 2);
    for s in &summaries {
        assert!(s.steps <= 100);
        assert!(s.total_reward <= 0.0);
        assert!(s.mean_loss.is_none());
        // Ten-step minimum green caps the number of changes.
        assert!(s.advances <= s.steps / intersection.min_green_steps);
    }
}

#[test]
fn step_log_brackets_every_episode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let intersection = IntersectionConfig::default();
    let cfg = quick(dir.path());

    let mut trainer = Trainer::new(sim(&intersection), &cfg, &intersection).expect("trainer");
    let report = trainer.train(None).expect("train");
    drop(trainer);

    let lines = kinds(cfg.log_path.as_deref().expect("log path"));
    let steps = lines.iter().filter(|v| v["kind"] == "step").count() as u64;
    assert_eq!(steps, report.global_steps);

    let markers: Vec<&Value> = lines.iter().filter(|v| v["kind"] == "episode").collect();
    assert_eq!(markers.len(), 4);
    assert_eq!(markers[0]["marker_type"], "start");
    assert_eq!(markers[1]["marker_type"], "end");
    assert_eq!(markers[1]["episode_id"], 0);
    assert_eq!(markers[3]["episode_id"], 1);
    assert_eq!(
        markers[3]["total_steps"].as_u64(),
        Some(report.episodes[1].steps)
    );
}

#[test]
fn interrupted_training_still_writes_the_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let intersection = IntersectionConfig::default();
    let cfg = TrainerConfig {
        episodes: 5,
        log_path: None,
        ..quick(dir.path())
    };
    let shutdown = Shutdown::new();
    shutdown.trigger();

    let mut trainer = Trainer::new(sim(&intersection), &cfg, &intersection).expect("trainer");
    let report = trainer.train(Some(&shutdown)).expect("train");
    assert!(report.interrupted);
    assert_eq!(report.episodes.len(), 1);
    assert_eq!(report.episodes[0].steps, 0);
    assert_eq!(report.episodes[0].termination_reason, TerminationReason::Manual);
    assert!(QNetPolicy::load(&cfg.artifact_out).is_ok());
}

#[test]
fn artifact_for_another_layout_is_rejected_even_with_fallback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let intersection = IntersectionConfig::default();
    let cfg = TrainerConfig {
        episodes: 1,
        max_steps_per_episode: 20,
        log_path: None,
        ..quick(dir.path())
    };
    Trainer::new(sim(&intersection), &cfg, &intersection)
        .expect("trainer")
        .train(None)
        .expect("train");

    let policy_cfg = PolicyConfig {
        artifact_path: Some(cfg.artifact_out.clone()),
        random_fallback: true,
        ..PolicyConfig::default()
    };
    let err = PolicyHandle::load(&policy_cfg, 3, 2).expect_err("width mismatch");
    assert_eq!(err, PolicyError::StateShapeMismatch { expected: 5, got: 4 });
}

#[test]
fn missing_artifact_degrades_only_when_allowed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = PolicyConfig {
        artifact_path: Some(dir.path().join("absent.json")),
        random_fallback: true,
        ..PolicyConfig::default()
    };
    let handle = PolicyHandle::load(&missing, 2, 2).expect("fallback");
    assert!(handle.is_fallback());
    assert_eq!(handle.current().state_width(), 4);

    let strict = PolicyConfig {
        random_fallback: false,
        ..missing
    };
    assert!(matches!(
        PolicyHandle::load(&strict, 2, 2),
        Err(PolicyError::Load(_))
    ));
}

// src/bin/phasegate_train.rs
//
// Offline trainer and evaluator.
//
// - train: episodic DQN against the simulator, writes the artifact
// - eval:  greedy gate-enforced episodes with a loaded artifact, prints
//          one JSON summary per episode
//
// Both default to TraCI; --queue-sim swaps in the seeded queue model.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use phasegate::config::Config;
use phasegate::control::Shutdown;
use phasegate::logging::init_tracing;
use phasegate::policy::{PolicyHandle, QNetPolicy};
use phasegate::rl::{evaluate, Trainer};
use phasegate::sim::{QueueSim, QueueSimConfig, Simulator, TraciSimulator};

#[derive(Debug, Parser)]
#[command(
    name = "phasegate-train",
    about = "Train and evaluate the phasegate action-value policy",
    version
)]
struct Args {
    /// YAML config file (optional).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-process queue model instead of TraCI.
    #[arg(long, global = true)]
    queue_sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train and write the artifact.
    Train {
        /// Overrides trainer.episodes.
        #[arg(long)]
        episodes: Option<u32>,
        /// Overrides trainer.artifact_out.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overrides trainer.seed.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Evaluate an artifact greedily behind the gate.
    Eval {
        /// Artifact to evaluate; defaults to policy.artifact_path.
        #[arg(long)]
        artifact: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        episodes: u32,
        /// Per-episode step cap (0 = until drained).
        #[arg(long, default_value_t = 0)]
        max_steps: u64,
    },
}

fn build_simulator(cfg: &Config, queue_sim: bool, seed: u64) -> Box<dyn Simulator> {
    if queue_sim {
        let qcfg = QueueSimConfig::default().with_seed(seed);
        Box::new(QueueSim::new(qcfg, cfg.intersection.clone()))
    } else {
        Box::new(TraciSimulator::new(cfg.simulator.clone(), cfg.intersection.clone()))
    }
}

fn train(cfg: Config, queue_sim: bool, shutdown: Shutdown) -> Result<()> {
    let sim = build_simulator(&cfg, queue_sim, cfg.trainer.seed);
    let mut trainer = Trainer::new(sim, &cfg.trainer, &cfg.intersection)?;
    let report = trainer.train(Some(&shutdown))?;
    info!(
        episodes = report.episodes.len(),
        global_steps = report.global_steps,
        updates = report.updates,
        interrupted = report.interrupted,
        artifact = %cfg.trainer.artifact_out.display(),
        "training finished"
    );
    Ok(())
}

fn eval(cfg: Config, queue_sim: bool, artifact: Option<PathBuf>, episodes: u32, max_steps: u64) -> Result<()> {
    let path = artifact
        .or_else(|| cfg.policy.artifact_path.clone())
        .context("no artifact given and policy.artifact_path is unset")?;
    let policy = QNetPolicy::load(&path).with_context(|| format!("loading {}", path.display()))?;
    let handle = PolicyHandle::new(Arc::new(policy));
    if handle.state_width() != cfg.intersection.state_width() {
        anyhow::bail!(
            "artifact expects state width {}, intersection has {}",
            handle.state_width(),
            cfg.intersection.state_width()
        );
    }

    let mut sim = build_simulator(&cfg, queue_sim, cfg.trainer.seed.wrapping_add(1));
    let policy = handle.current();
    let summaries = evaluate(
        &mut sim,
        policy.as_ref(),
        &cfg.intersection,
        &cfg.trainer.reward,
        episodes,
        max_steps,
    )?;
    for summary in &summaries {
        println!("{}", serde_json::to_string(summary)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("phasegate");
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref()).context("loading config")?;
    let queue_sim = args.queue_sim;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("ctrl-c received; finishing current step");
                    shutdown.trigger();
                }
                Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
            }
        });
    }

    match args.command {
        Command::Train { episodes, out, seed } => {
            if let Some(n) = episodes {
                cfg.trainer.episodes = n;
            }
            if let Some(path) = out {
                cfg.trainer.artifact_out = path;
            }
            if let Some(s) = seed {
                cfg.trainer.seed = s;
            }
            cfg.validate().context("invalid config")?;
            cfg.log_startup("train");
            tokio::task::spawn_blocking(move || train(cfg, queue_sim, shutdown))
                .await
                .context("trainer panicked")?
        }
        Command::Eval {
            artifact,
            episodes,
            max_steps,
        } => {
            cfg.validate().context("invalid config")?;
            cfg.log_startup("eval");
            tokio::task::spawn_blocking(move || eval(cfg, queue_sim, artifact, episodes, max_steps))
                .await
                .context("evaluation panicked")?
        }
    }
}

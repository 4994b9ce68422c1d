// src/main.rs
//
// Controller entrypoint.
//
// Subcommands:
// - pull:   read state straight from the simulator each tick
// - push:   subscribe at the broker, consume notifications, publish
//           `forcePhase` commands
// - bridge: own the simulator and mirror it into the broker
//
// Config precedence: defaults < --config YAML < PHASEGATE_* env.
// Ctrl-C triggers the orderly shutdown sequence in every mode.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use phasegate::bridge::Bridge;
use phasegate::broker::BrokerClient;
use phasegate::config::Config;
use phasegate::control::{run_pull_loop, run_push_loop, Controller, PushRuntime, Shutdown};
use phasegate::logging::init_tracing;
use phasegate::ops::{start_ops_server, ControllerMetrics, HealthState};
use phasegate::policy::PolicyHandle;
use phasegate::rl::TelemetrySink;
use phasegate::sim::{QueueSim, QueueSimConfig, Simulator, TraciSimulator};

#[derive(Debug, Parser)]
#[command(
    name = "phasegate",
    about = "Adaptive traffic-light controller with a minimum-green gate",
    version
)]
struct Args {
    /// YAML config file (optional).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Control the simulator directly, one decision per tick.
    Pull {
        /// Stop after this many ticks (0 = until drained).
        #[arg(long, default_value_t = 0)]
        max_ticks: u64,
        /// Use the in-process queue model instead of TraCI.
        #[arg(long)]
        queue_sim: bool,
    },
    /// Control through the broker: notifications in, forcePhase out.
    Push,
    /// Publish simulator state to the broker and apply forcePhase.
    Bridge {
        #[arg(long, default_value_t = 0)]
        max_ticks: u64,
        #[arg(long)]
        queue_sim: bool,
    },
}

impl Command {
    fn mode(&self) -> &'static str {
        match self {
            Command::Pull { .. } => "pull",
            Command::Push => "push",
            Command::Bridge { .. } => "bridge",
        }
    }
}

fn build_simulator(cfg: &Config, queue_sim: bool) -> Box<dyn Simulator> {
    if queue_sim {
        let qcfg = QueueSimConfig::default().with_seed(cfg.policy.seed);
        Box::new(QueueSim::new(qcfg, cfg.intersection.clone()))
    } else {
        Box::new(TraciSimulator::new(cfg.simulator.clone(), cfg.intersection.clone()))
    }
}

fn install_ctrl_c(shutdown: &Shutdown) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; shutting down");
                shutdown.trigger();
            }
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
    });
}

fn build_controller(cfg: &Config, metrics: &ControllerMetrics) -> Result<Controller> {
    let policy = PolicyHandle::load(
        &cfg.policy,
        cfg.intersection.detectors.len(),
        cfg.intersection.num_phases(),
    )
    .context("loading policy")?;
    let controller = Controller::new(&cfg.intersection, Arc::new(policy), metrics.clone())?
        .with_telemetry(TelemetrySink::from_path(cfg.ops.decision_log.as_deref()));
    Ok(controller)
}

async fn run_pull(cfg: Config, metrics: ControllerMetrics, shutdown: Shutdown, max_ticks: u64, queue_sim: bool) -> Result<()> {
    let mut controller = build_controller(&cfg, &metrics)?;
    let mut sim = build_simulator(&cfg, queue_sim);
    let report = tokio::task::spawn_blocking(move || {
        run_pull_loop(&mut sim, &mut controller, max_ticks, &shutdown)
    })
    .await
    .context("pull loop panicked")??;
    info!(
        ticks = report.ticks,
        advances = report.advances,
        reason = ?report.reason,
        "pull loop finished"
    );
    Ok(())
}

async fn run_push(cfg: Config, metrics: ControllerMetrics, shutdown: Shutdown) -> Result<()> {
    let mut controller = build_controller(&cfg, &metrics)?;
    let client = BrokerClient::new(&cfg.broker)?.with_metrics(metrics.clone());
    let runtime = PushRuntime::start(&cfg, client.clone(), metrics)
        .await
        .context("starting push runtime")?;
    info!(port = runtime.port(), "notification endpoint ready");

    let result = run_push_loop(&mut controller, runtime.queue(), &client, &shutdown).await;
    runtime.shutdown().await;
    let report = result?;
    info!(
        ticks = report.ticks,
        advances = report.advances,
        reason = ?report.reason,
        "push loop finished"
    );
    Ok(())
}

async fn run_bridge(cfg: Config, metrics: ControllerMetrics, shutdown: Shutdown, max_ticks: u64, queue_sim: bool) -> Result<()> {
    let client = BrokerClient::new(&cfg.broker)?.with_metrics(metrics.clone());
    let sim = build_simulator(&cfg, queue_sim);
    let mut bridge = Bridge::new(sim, client, &cfg.intersection, metrics);
    bridge.run(max_ticks, &shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("phasegate");
    let args = Args::parse();

    let cfg = Config::load(args.config.as_deref()).context("loading config")?;
    cfg.validate().context("invalid config")?;
    cfg.log_startup(args.command.mode());

    let metrics = ControllerMetrics::new();
    let health = HealthState::new();
    if let Some(addr) = cfg.ops.metrics_addr.as_deref() {
        start_ops_server(addr, metrics.clone(), health.clone());
    }

    let shutdown = Shutdown::new();
    install_ctrl_c(&shutdown);
    health.set_ready(true);

    let result = match args.command {
        Command::Pull { max_ticks, queue_sim } => run_pull(cfg, metrics, shutdown, max_ticks, queue_sim).await,
        Command::Push => run_push(cfg, metrics, shutdown).await,
        Command::Bridge { max_ticks, queue_sim } => run_bridge(cfg, metrics, shutdown, max_ticks, queue_sim).await,
    };
    health.set_ready(false);
    if let Err(e) = &result {
        health.set_healthy(false);
        error!(error = %e, "controller stopped with an error");
    }
    result
}

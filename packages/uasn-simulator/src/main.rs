//! main.rs — uasn-sim scenario runner
//!
//! Wires a canned scenario against the simulation kernel, runs it to the
//! horizon, and reports per-node localization errors. The core library
//! has no CLI surface of its own; this binary is one host program among
//! possible others.

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use uasn_simulator::scenarios::{self, Protocol, ScenarioConfig};
use uasn_simulator::{Environment, Params, RunOptions};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "uasn-sim", about = "Underwater acoustic sensor-network localization simulator")]
struct Args {
    /// Protocol to run: ups, lst, rls or lsls
    #[arg(short, long, default_value = "lst")]
    protocol: String,
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Master random seed
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Simulation horizon (s)
    #[arg(long, default_value = "3000.0")]
    horizon: f64,
    /// Log every transmission and delivery
    #[arg(short, long)]
    verbose: bool,
    /// Seconds between node snapshots in the log (0 = off)
    #[arg(long, default_value = "0.0")]
    snapshot: f64,
    /// Write the per-node results as JSON to this path
    #[arg(long)]
    json_out: Option<String>,
}

// ── Config structs ────────────────────────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FullConfig {
    params: Params,
    scenario: ScenarioConfig,
}

#[derive(Debug, Serialize)]
struct NodeResult {
    name: String,
    status: String,
    position: [f64; 3],
    estimate: Option<[f64; 3]>,
    error: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    protocol: String,
    seed: u64,
    horizon: f64,
    localized: usize,
    unlocalized: usize,
    error_min: Option<f64>,
    error_median: Option<f64>,
    error_max: Option<f64>,
    error_mean: Option<f64>,
    nodes: Vec<NodeResult>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "uasn_simulator=info,uasn_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let protocol = match args.protocol.as_str() {
        "ups" => Protocol::Ups,
        "lst" => Protocol::Lst,
        "rls" => Protocol::Rls,
        "lsls" => Protocol::Lsls,
        other => bail!("unknown protocol {other:?} (expected ups, lst, rls or lsls)"),
    };

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config file")?;

    info!(
        "uasn-sim starting: {} over {:.0} m x {:.0} m x {:.0} m, seed {}",
        args.protocol, cfg.scenario.area, cfg.scenario.area, cfg.scenario.depth, args.seed
    );

    let mut env = Environment::with_seed(cfg.scenario.volume(), cfg.params, args.seed)
        .context("invalid parameters")?;
    let count = scenarios::build(&mut env, protocol, &cfg.scenario)
        .context("scenario construction failed")?;
    info!(nodes = count, horizon = args.horizon, "scenario built");

    env.run(
        args.horizon,
        RunOptions { verbose: args.verbose, snapshot_interval: args.snapshot },
    );

    let report = summarize(&env, &args);
    info!(
        "localized {}/{} nodes",
        report.localized,
        report.localized + report.unlocalized
    );
    if let (Some(min), Some(median), Some(max), Some(mean)) = (
        report.error_min,
        report.error_median,
        report.error_max,
        report.error_mean,
    ) {
        info!("error min {min:.3} m, median {median:.3} m, max {max:.3} m, mean {mean:.3} m");
    }

    if let Some(path) = &args.json_out {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {path}"))?;
        info!("results written to {path}");
    }

    Ok(())
}

fn summarize(env: &Environment, args: &Args) -> RunReport {
    let mut nodes = Vec::new();
    let mut errors = Vec::new();
    for node in env.nodes() {
        let p = node.position();
        let estimate = node.estimate();
        let error = estimate.map(|e| e.dist(&p));
        if let Some(e) = error {
            errors.push(e);
        }
        nodes.push(NodeResult {
            name: node.name().to_string(),
            status: node.status(),
            position: [p.x, p.y, p.z],
            estimate: estimate.map(|e| [e.x, e.y, e.z]),
            error,
        });
    }
    errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let localized = errors.len();
    RunReport {
        protocol: args.protocol.clone(),
        seed: args.seed,
        horizon: args.horizon,
        localized,
        unlocalized: nodes.len() - localized,
        error_min: errors.first().copied(),
        error_median: (!errors.is_empty()).then(|| errors[errors.len() / 2]),
        error_max: errors.last().copied(),
        error_mean: (!errors.is_empty())
            .then(|| errors.iter().sum::<f64>() / errors.len() as f64),
        nodes,
    }
}

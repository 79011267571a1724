mod config;
mod sim;

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use crate::config::{parse_hash_function, parse_isolation, ServerConfig};

#[derive(Parser)]
#[command(name = "skein-server", about = "runs a skein cluster in-process under a contended workload")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "SKEIN_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// nodes in the initial membership view
    #[arg(short, long, env = "SKEIN_NODES")]
    nodes: Option<usize>,

    /// number of segments keys are hashed into. fixed for the cluster lifetime
    #[arg(long, env = "SKEIN_NUM_SEGMENTS")]
    num_segments: Option<u32>,

    /// owners per segment, primary included
    #[arg(long, env = "SKEIN_REPLICATION_FACTOR")]
    replication_factor: Option<usize>,

    /// key hash: murmur2 or murmur2-compat
    #[arg(long, env = "SKEIN_HASH_FUNCTION")]
    hash_function: Option<String>,

    /// transaction isolation: read-committed or repeatable-read
    #[arg(long, env = "SKEIN_ISOLATION")]
    isolation: Option<String>,

    /// send commit messages in the background instead of waiting for acks
    #[arg(long, env = "SKEIN_ASYNC_COMMIT")]
    async_commit: bool,

    /// concurrent workload clients
    #[arg(long, env = "SKEIN_CLIENTS")]
    clients: Option<usize>,

    /// increments each client commits
    #[arg(long, env = "SKEIN_INCREMENTS")]
    increments: Option<u64>,

    /// number of shared counters
    #[arg(long, env = "SKEIN_COUNTERS")]
    counters: Option<usize>,

    /// skip adding a node during the run
    #[arg(long, env = "SKEIN_NO_JOIN")]
    no_join: bool,

    /// skip crashing a node during the run
    #[arg(long, env = "SKEIN_NO_CRASH")]
    no_crash: bool,
}

/// Applies CLI overrides. Only values given on the command line or in the
/// environment take effect, so the file keeps the rest.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(n) = args.nodes {
        cfg.nodes = n;
    }
    if let Some(n) = args.num_segments {
        cfg.cluster.num_segments = n;
    }
    if let Some(n) = args.replication_factor {
        cfg.cluster.replication_factor = n;
    }
    if let Some(ref name) = args.hash_function {
        cfg.cluster.hash_function = parse_hash_function(name)
            .unwrap_or_else(|e| exit_err(format!("invalid hash-function value: {e}")));
    }
    if let Some(ref level) = args.isolation {
        cfg.cluster.isolation = parse_isolation(level)
            .unwrap_or_else(|e| exit_err(format!("invalid isolation value: {e}")));
    }
    if args.async_commit {
        cfg.cluster.sync_commit_phase = false;
    }
    if let Some(n) = args.clients {
        cfg.workload.clients = n;
    }
    if let Some(n) = args.increments {
        cfg.workload.increments = n;
    }
    if let Some(n) = args.counters {
        cfg.workload.counters = n;
    }
    if args.no_join {
        cfg.workload.join = false;
    }
    if args.no_crash {
        cfg.workload.crash = false;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skein=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        exit_err(format!("invalid config: {e}"));
    }

    info!(
        nodes = cfg.nodes,
        clients = cfg.workload.clients,
        counters = cfg.workload.counters,
        hash = %cfg.cluster.hash_function,
        isolation = ?cfg.cluster.isolation,
        "starting simulation"
    );

    let report = sim::run(&cfg)
        .await
        .unwrap_or_else(|e| exit_err(format!("simulation failed: {e}")));

    info!(
        committed = report.committed,
        gave_up = report.gave_up,
        observed = report.observed,
        aborts = report.aborts.total(),
        write_skew = report.aborts.write_skew,
        topology_changed = report.aborts.topology_changed,
        timeouts = report.aborts.timeout,
        unavailable = report.aborts.unavailable,
        topology_id = report.topology_id,
        elapsed = ?report.elapsed,
        "simulation finished"
    );

    if !report.is_consistent() {
        error!(
            committed = report.committed,
            observed = report.observed,
            data_loss = report.data_loss,
            "counter totals do not match committed increments"
        );
        std::process::exit(2);
    }
}

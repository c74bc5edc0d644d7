//! Converge Harness
//!
//! Runs convergence scenarios against the built-in simulated cluster and
//! prints a JSON report.

use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use converge_harness::{
    register_builtin, BackupRequest, DriverRegistries, Error, Harness, HarnessConfig,
    HarnessStatus, ResizeType, Result, SimCluster, SIM_DRIVER_NAME,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Converge Harness - drive infrastructure operations to a terminal state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Number of storage workers in the simulated cluster
    #[arg(long, env = "SIM_NODES", default_value = "4")]
    nodes: usize,

    /// Override the polling interval of every recipe, in seconds
    #[arg(long, env = "POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Scenario {
    All,
    Membership,
    Expand,
    Upgrade,
    Backup,
    Rejoin,
    Decommission,
}

impl Scenario {
    fn expand(self) -> Vec<Scenario> {
        match self {
            Scenario::All => vec![
                Scenario::Membership,
                Scenario::Expand,
                Scenario::Upgrade,
                Scenario::Backup,
                Scenario::Rejoin,
                Scenario::Decommission,
            ],
            single => vec![single],
        }
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Serialize)]
struct ScenarioReport {
    scenario: Scenario,
    ok: bool,
    detail: String,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct Report {
    version: &'static str,
    status: HarnessStatus,
    scenarios: Vec<ScenarioReport>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Converge Harness");
    info!("  Version: {}", converge_harness::VERSION);
    info!("  Scenario: {:?}", args.scenario);
    info!("  Simulated workers: {}", args.nodes);

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_yaml_file(path)?,
        None => HarnessConfig::default(),
    };
    if config.drivers.backup.is_none() {
        config.drivers.backup = Some(SIM_DRIVER_NAME.to_string());
    }
    if let Some(secs) = args.poll_interval {
        config.convergence.set_interval(secs);
    }

    let cluster = SimCluster::with_topology(args.nodes);
    let drivers = DriverRegistries::new();
    register_builtin(&drivers, cluster)?;

    let harness = Harness::init(config, drivers).await?;

    let on_signal = harness.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            on_signal.shutdown();
        }
    });

    let mut reports = Vec::new();
    for scenario in args.scenario.expand() {
        let start = Instant::now();
        let outcome = run_scenario(&harness, scenario).await;
        let elapsed_ms = start.elapsed().as_millis();
        let report = match outcome {
            Ok(detail) => {
                info!("Scenario {:?} converged: {}", scenario, detail);
                ScenarioReport { scenario, ok: true, detail, elapsed_ms }
            }
            Err(e) => {
                error!("Scenario {:?} failed: {}", scenario, e);
                ScenarioReport { scenario, ok: false, detail: e.to_string(), elapsed_ms }
            }
        };
        reports.push(report);
    }

    let failed = reports.iter().filter(|r| !r.ok).count();
    let report = Report {
        version: converge_harness::VERSION,
        status: harness.status(),
        scenarios: reports,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failed > 0 {
        return Err(Error::Internal(format!("{} scenario(s) failed", failed)));
    }
    Ok(())
}

// =============================================================================
// Scenarios
// =============================================================================

async fn run_scenario(harness: &Harness, scenario: Scenario) -> Result<String> {
    match scenario {
        Scenario::All => Err(Error::Internal("scenario list was not expanded".to_string())),
        Scenario::Membership => {
            let members = harness.wait_for_membership().await?;
            Ok(format!("{} healthy metadata members", members.len()))
        }
        Scenario::Expand => {
            let pool = harness
                .nodes()
                .storage_nodes()
                .into_iter()
                .flat_map(|n| n.pools)
                .next()
                .ok_or_else(|| Error::Configuration("no storage pools registered".to_string()))?;
            let target = pool.total_size_gib() * 2;
            let expanded = harness.expand_pool(&pool.uuid, ResizeType::Auto, target).await?;
            Ok(format!("pool {} is {} GiB", expanded.uuid, expanded.total_size_gib()))
        }
        Scenario::Upgrade => {
            let upgraded = harness.upgrade("3.2.0").await?;
            Ok(format!("{} nodes upgraded", upgraded.len()))
        }
        Scenario::Backup => {
            let info = harness
                .backup(BackupRequest {
                    name: format!("harness-{}", chrono::Utc::now().timestamp()),
                    cluster: "sim".to_string(),
                    namespaces: vec!["default".to_string()],
                    backup_location: "sim-location".to_string(),
                })
                .await?;
            Ok(format!("backup {} is {}", info.name, info.status))
        }
        Scenario::Rejoin => {
            let name = spare_node(harness)?;
            let removed = harness.decommission(&name).await?;
            let rejoined = harness.rejoin(&removed).await?;
            Ok(format!("{} rejoined as {}", rejoined.name, identity(&rejoined)))
        }
        Scenario::Decommission => {
            let name = spare_node(harness)?;
            let removed = harness.decommission(&name).await?;
            Ok(format!("{} decommissioned", removed.name))
        }
    }
}

/// Last storage node that is not a metadata member
fn spare_node(harness: &Harness) -> Result<String> {
    harness
        .nodes()
        .storage_nodes()
        .into_iter()
        .rev()
        .find(|n| !n.is_metadata_node)
        .map(|n| n.name)
        .ok_or_else(|| Error::Configuration("no spare storage node to remove".to_string()))
}

fn identity(node: &converge_harness::Node) -> String {
    node.uuid().map(|id| id.to_string()).unwrap_or_default()
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries only the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

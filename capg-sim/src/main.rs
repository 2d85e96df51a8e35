//! capg-sim: drives reconciliation passes for one cluster against an in-memory
//! cloud.
//!
//! Builds a cluster with one control-plane machine and a set of workers, runs
//! the reconcilers pass by pass the way a controller would, optionally injects
//! faults, and prints the resulting status.

use std::time::Duration;

use anyhow::{Context as _, Result, ensure};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod sim;

use sim::{Report, SimConfig, Simulator};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

/// capg reconciliation simulator
#[derive(Parser, Debug)]
#[command(name = "capg-sim", version, about)]
struct Args {
    /// Cluster name
    #[arg(long, default_value = "capg-sim")]
    cluster: String,

    /// Namespace the cluster's resources live in
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Cloud project
    #[arg(long, default_value = "capg-sim-project")]
    project: String,

    /// Cloud region
    #[arg(long, default_value = "us-east1")]
    region: String,

    /// VPC network name (defaults to "default")
    #[arg(long)]
    network: Option<String>,

    /// Failure domains (zones), comma separated
    #[arg(long, value_delimiter = ',', default_value = "us-east1-b,us-east1-c,us-east1-d")]
    zones: Vec<String>,

    /// Number of worker machines
    #[arg(long, default_value = "3")]
    replicas: u32,

    /// Instance machine type
    #[arg(long, default_value = "n2-standard-4")]
    machine_type: String,

    /// Instance source image
    #[arg(long, default_value = "capi-ubuntu-2204")]
    image: String,

    /// Number of reconcile passes
    #[arg(long, default_value = "5")]
    passes: usize,

    /// Delay between passes in milliseconds
    #[arg(long, default_value = "200")]
    interval_ms: u64,

    /// Per-pass timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Control-plane API server port
    #[arg(long, default_value = "6443")]
    port: u16,

    /// Pass at which bootstrap secrets become available
    #[arg(long, default_value = "0")]
    bootstrap_delay_passes: usize,

    /// Terminate a worker's instance before this pass
    #[arg(long)]
    terminate_after_passes: Option<usize>,

    /// Run out of instance quota before the last machine is created
    #[arg(long)]
    quota_exceeded: bool,

    /// Delete all infrastructure after the reconcile passes
    #[arg(long)]
    teardown: bool,

    /// Output format for the final status
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capg_cloud=info,capg_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    ensure!(!args.zones.is_empty(), "at least one zone is required");
    ensure!(args.timeout > 0, "--timeout must be at least one second");

    let config = SimConfig {
        cluster: args.cluster,
        namespace: args.namespace,
        project: args.project,
        region: args.region,
        network: args.network,
        zones: args.zones,
        replicas: args.replicas,
        machine_type: args.machine_type,
        image: args.image,
        passes: args.passes,
        interval: Duration::from_millis(args.interval_ms),
        timeout: Duration::from_secs(args.timeout),
        port: args.port,
        bootstrap_delay_passes: args.bootstrap_delay_passes,
        terminate_after_passes: args.terminate_after_passes,
        quota_exceeded: args.quota_exceeded,
        teardown: args.teardown,
    };

    info!(
        cluster = %config.cluster,
        project = %config.project,
        replicas = config.replicas,
        passes = config.passes,
        "Starting capg-sim"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, cancelling the running pass");
            signal.cancel();
        }
    });

    let mut simulator = Simulator::new(config);
    let report = simulator.run(shutdown).await?;

    match args.output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report).context("failed to encode report")?;
            println!("{}", json);
        }
        OutputFormat::Text => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &Report) {
    println!(
        "cluster {} after {} passes: ready={} converged={}",
        report.cluster, report.passes, report.status.ready, report.converged
    );
    if let Some(endpoint) = &report.status.control_plane_endpoint {
        println!("  endpoint  {}", endpoint);
    }
    if let Some(link) = &report.status.network.self_link {
        println!("  network   {}", link);
    }
    for m in &report.machines {
        let addresses: Vec<&str> = m.status.addresses.iter().map(|a| a.address.as_str()).collect();
        println!(
            "  {:<28} {:<13} {:<12} {:<13} {}",
            m.name,
            m.role.as_str(),
            m.zone,
            m.status.instance_status.as_str(),
            addresses.join(",")
        );
        if let Some(failure) = m.status.failure() {
            println!("    failed: {}: {}", failure.reason, failure.message);
        }
    }
}

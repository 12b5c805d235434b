//! Main binary for the Nexus scheduler

use anyhow::Context;
use clap::Parser;
use nexus_profile::ModelDatabase;
use nexus_proto::SchedulerCtrlServer;
use nexus_scheduler::push::GrpcControlFactory;
use nexus_scheduler::workload::StaticWorkloadTable;
use nexus_scheduler::{Scheduler, SchedulerConfig, SchedulerService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nexus-scheduler")]
#[command(about = "Central scheduler for the Nexus inference serving system")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Control RPC port
    #[arg(long, default_value_t = 10001)]
    port: u16,

    /// Number of runtime worker threads
    #[arg(long, default_value_t = 4)]
    nthread: usize,

    /// Model database root directory
    #[arg(long = "model_root", value_name = "DIR")]
    model_root: PathBuf,

    /// Static workload file (YAML)
    #[arg(long, value_name = "FILE")]
    workload: Option<PathBuf>,

    /// Beacon interval in seconds
    #[arg(long, default_value_t = 2)]
    beacon: u64,

    /// Epoch scheduling interval in seconds
    #[arg(long, default_value_t = 10)]
    epoch: u64,

    /// Enable epoch scheduling
    #[arg(long = "epoch_schedule", default_value_t = true, action = clap::ArgAction::Set)]
    epoch_schedule: bool,

    /// Enable prefix batching
    #[arg(long = "prefix_batch", default_value_t = true, action = clap::ArgAction::Set)]
    prefix_batch: bool,

    /// Prometheus exporter port (0 disables)
    #[arg(long = "metrics_port", default_value_t = 0)]
    metrics_port: u16,

    /// Log level
    #[arg(long = "log_level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let config = SchedulerConfig {
        port: cli.port,
        nthread: cli.nthread,
        model_root: cli.model_root.clone(),
        workload_file: cli.workload.clone(),
        beacon_interval_sec: cli.beacon,
        epoch_interval_sec: cli.epoch,
        epoch_schedule: cli.epoch_schedule,
        prefix_batch: cli.prefix_batch,
        metrics_port: cli.metrics_port,
        ..Default::default()
    };
    config.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.nthread)
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: SchedulerConfig) -> anyhow::Result<()> {
    // Fatal startup errors: unreadable model db, invalid workload file.
    let db = Arc::new(
        ModelDatabase::init(&config.model_root)
            .with_context(|| format!("model db root {}", config.model_root.display()))?,
    );
    let workloads = match &config.workload_file {
        Some(path) => {
            info!("Load workload file from {}", path.display());
            StaticWorkloadTable::load(path)
                .with_context(|| format!("workload file {}", path.display()))?
        }
        None => StaticWorkloadTable::default(),
    };

    let factory = Arc::new(GrpcControlFactory::new(config.rpc_timeout()));
    let scheduler = Arc::new(Scheduler::new(config.clone(), db, workloads, factory)?);

    if config.metrics_port != 0 {
        let metrics = scheduler.metrics();
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(addr).await {
                error!("Metrics exporter failed: {}", e);
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let control_loop = tokio::spawn(scheduler.clone().run_control_loop(shutdown_rx));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!("Scheduler listening on {}", addr);
    let service = SchedulerService::new(scheduler);
    tonic::transport::Server::builder()
        .add_service(SchedulerCtrlServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("rpc server failed")?;

    // Stop the control loop; in-flight passes finish under the mutex.
    let _ = shutdown_tx.send(true);
    let _ = control_loop.await;
    info!("Scheduler stopped");
    Ok(())
}

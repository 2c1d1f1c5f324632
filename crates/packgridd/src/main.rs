//! packgridd: the packgrid daemon.
//!
//! One process assembles the whole control plane:
//! - Registry of crash-safe collections under the data directory
//! - One engine controller per item of the `engines` collection
//! - Fleet scheduler with the pending deploy and build queues
//!
//! # Usage
//!
//! ```text
//! packgridd run --config /etc/packgrid.toml --data-dir /var/lib/packgrid
//! packgridd config --config /etc/packgrid.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use packgrid_core::{GridConfig, NotificationHub};
use packgrid_engine::{ControllerContext, HttpConnector, PortAllocator};
use packgrid_scheduler::Scheduler;
use packgrid_state::Registry;

const DEFAULT_FILTER: &str = "info,packgrid=debug";

#[derive(Parser)]
#[command(name = "packgridd", about = "packgrid container fleet daemon")]
struct Cli {
    /// Path to packgrid.toml; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted.
    Run {
        /// Seconds between fleet status log lines; 0 disables them.
        #[arg(long, default_value = "300")]
        status_interval: u64,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GridConfig> {
    let mut config = match &cli.config {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => GridConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run { status_interval } => run(config, status_interval).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: GridConfig, status_interval: u64) -> anyhow::Result<()> {
    info!(data_dir = %config.data_dir.display(), "packgrid daemon starting");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    std::fs::create_dir_all(config.ssh_keys_dir())?;
    std::fs::create_dir_all(config.perf_logs_dir())?;

    // ── Store ──────────────────────────────────────────────────

    let registry = Registry::open(&config.data_dir, NotificationHub::new());
    registry.init_all().await.context("loading collections")?;
    info!(
        engines = registry.engines.len(),
        packs = registry.packs.len(),
        bundles = registry.bundles.len(),
        "collections loaded"
    );

    // ── Scheduler ──────────────────────────────────────────────

    let scheduler = Scheduler::new(ControllerContext {
        registry: registry.clone(),
        config: Arc::new(config),
        connector: Arc::new(HttpConnector),
        ports: PortAllocator::new(),
    });
    scheduler.start();

    let status = (status_interval > 0).then(|| {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(status_interval));
            tick.tick().await;
            loop {
                tick.tick().await;
                log_fleet(&scheduler);
            }
        })
    });

    // ── Shutdown ───────────────────────────────────────────────

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "signal handler failed, shutting down");
    }
    info!("shutdown signal received");
    if let Some(status) = status {
        status.abort();
    }
    scheduler.shutdown().await;

    info!("packgrid daemon stopped");
    Ok(())
}

fn log_fleet(scheduler: &Scheduler) {
    for t in scheduler.telemetry() {
        let busy: usize = t.queues.iter().map(|(_, s)| s.running + s.pending).sum();
        info!(
            engine = %t.id,
            status = %t.status,
            free_ips = t.free_ips,
            capacity = %format!("{}/{}", t.capacity_used, t.capacity_limit),
            deploy_ops = t.deploy_ops,
            queued_tasks = busy,
            "engine status"
        );
    }
    info!(
        pending_deploys = scheduler.pending_deploys().len(),
        pending_builds = scheduler.pending_builds().len(),
        "scheduler status"
    );
}

//! ChunkVault Rebalancer
//!
//! Restores the replica floor on every chunk and optionally evens out node
//! load.
//!
//! # Commands
//! - `run` - Repair, then optionally rebalance (default)
//! - `health` - Probe every node and refresh its liveness
//! - `refresh-metrics` - Recompute node counters from replica links

use anyhow::{Context, Result};
use chunkvault_metadata::{Database, DbConfig, HealthProbe, MetadataRepository};
use chunkvault_rebalancer::{
    refresh_node_metrics, CoordinatorError, EventLevel, RebalancerConfig, RunCoordinator,
    RunReport,
};
use chunkvault_storage::{NodeConnector, S3Connector};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkvault-rebalancer")]
#[command(about = "ChunkVault replica repair and load rebalancing")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "CHUNKVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL (overrides config file and DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run report format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Repair under-replicated chunks, then optionally rebalance
    Run(RunArgs),

    /// Probe every node and update its status
    Health,

    /// Recompute node load and storage usage from replica links
    RefreshMetrics,
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Floor on online replicas per chunk
    #[arg(long)]
    min_replicas: Option<usize>,

    /// Rebalance load after repair
    #[arg(long)]
    balance_load: bool,

    /// Report the plan without moving data
    #[arg(long)]
    dry_run: bool,

    /// Repeat every N seconds until interrupted
    #[arg(long)]
    interval: Option<u64>,

    /// Recompute node counters before each run
    #[arg(long)]
    refresh_metrics: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Defaults, then the config file, then the environment, then flags
fn load_config(cli: &Cli, args: &RunArgs) -> Result<RebalancerConfig> {
    let mut config = match &cli.config {
        Some(path) => RebalancerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RebalancerConfig::default(),
    };
    config.apply_env()?;

    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(min) = args.min_replicas {
        config.min_replicas = min;
    }
    if let Some(secs) = args.interval {
        config.interval_secs = secs;
    }
    config.balance_load |= args.balance_load;
    config.dry_run |= args.dry_run;
    config.refresh_metrics |= args.refresh_metrics;

    config.validate()?;
    Ok(config)
}

async fn connect(
    config: &RebalancerConfig,
) -> Result<(Arc<dyn MetadataRepository>, Arc<dyn NodeConnector>)> {
    let db_config = match &config.database_url {
        Some(url) => DbConfig::with_url(url.clone()),
        None => DbConfig::default(),
    };
    let db = Database::new(db_config)
        .await
        .context("connecting to the metadata database")?;
    db.migrate().await?;

    let repo: Arc<dyn MetadataRepository> = Arc::new(db);
    let connector: Arc<dyn NodeConnector> =
        Arc::new(S3Connector::new(config.transport.clone()).await);
    Ok((repo, connector))
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for event in &report.events {
        let prefix = match event.level() {
            EventLevel::Info => "[info]",
            EventLevel::Success => "[ok]",
            EventLevel::Warning => "[warn]",
        };
        println!("{} {}", prefix, event);
    }
    println!("{}", report.summary.summary());
    Ok(())
}

async fn run_once(coordinator: &RunCoordinator, format: OutputFormat) -> Result<()> {
    match coordinator.run().await {
        Ok(report) => print_report(&report, format),
        Err(CoordinatorError::NoOnlineNodes) => {
            anyhow::bail!("no online nodes, nothing can be repaired")
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_daemon(
    coordinator: &RunCoordinator,
    interval: Duration,
    format: OutputFormat,
) -> Result<()> {
    info!(interval_secs = interval.as_secs(), "Rebalancer daemon started");

    loop {
        match coordinator.run().await {
            Ok(report) => print_report(&report, format)?,
            Err(e) => error!(error = %e, "Run failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Rebalancer daemon stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    init_tracing(cli.log_format);

    let command = cli
        .command
        .take()
        .unwrap_or_else(|| Commands::Run(RunArgs::default()));
    let default_args = RunArgs::default();
    let run_args = match &command {
        Commands::Run(args) => args,
        _ => &default_args,
    };
    let config = load_config(&cli, run_args)?;
    let (repo, connector) = connect(&config).await?;

    match command {
        Commands::Run(_) => {
            info!(
                min_replicas = config.min_replicas,
                balance_load = config.balance_load,
                dry_run = config.dry_run,
                "Starting ChunkVault rebalancer"
            );
            let interval = config.interval();
            let coordinator = RunCoordinator::new(repo, connector, config);
            match interval {
                Some(interval) => run_daemon(&coordinator, interval, cli.output).await,
                None => run_once(&coordinator, cli.output).await,
            }
        }
        Commands::Health => {
            let probe = HealthProbe::new(repo, connector, config.health_config());
            let summary = probe.check_all().await?;
            for result in &summary.results {
                let latency = result
                    .latency_ms
                    .map(|ms| format!("{:.1} ms", ms))
                    .unwrap_or_else(|| "-".to_string());
                match &result.error {
                    Some(err) => println!("{} {} ({})", result.status, result.node_url, err),
                    None => println!("{} {} {}", result.status, result.node_url, latency),
                }
            }
            println!("{}", summary);
            Ok(())
        }
        Commands::RefreshMetrics => {
            let refreshed = refresh_node_metrics(&*repo).await?;
            for m in &refreshed {
                let marker = if m.corrected { " (corrected)" } else { "" };
                println!(
                    "{} load={} storage={}{}",
                    m.url, m.load, m.storage_usage, marker
                );
            }
            println!("{} nodes refreshed", refreshed.len());
            Ok(())
        }
    }
}

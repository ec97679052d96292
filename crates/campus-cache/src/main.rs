use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use campus_cache::config::loader::load_config;
use campus_cache::{CacheConfig, CacheService, metrics, observability};

#[derive(Parser)]
#[command(name = "campus-cache")]
#[command(about = "Two-tier cache for the campus administration backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to campus-cache.toml when present)
    #[arg(short, long, global = true, env = "CAMPUS_CACHE_CONFIG")]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print it
    Check,
    /// Connect, print cache and cluster statistics as JSON, and exit
    Stats,
    /// Keep clusters monitored until interrupted; a changed `logging.level`
    /// in the config file is applied at the next report
    Run {
        /// Seconds between statistics reports
        #[arg(long, default_value_t = 60)]
        report_interval: u64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;
    observability::init_tracing(&config.logging);

    match cli.command {
        Commands::Check => {
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("{rendered}");
        }
        Commands::Stats => {
            let service = connect(config).await?;
            let stats = service.statistics();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            service.shutdown();
        }
        Commands::Run { report_interval } => {
            metrics::init_metrics();
            let mut log_level = config.logging.level.clone();
            let service = connect(config).await?;
            let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        report(&service);
                        reload_log_level(cli.config.as_deref(), &mut log_level);
                    }
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("waiting for ctrl-c")?;
                        tracing::info!("interrupt received, shutting down");
                        break;
                    }
                }
            }
            service.shutdown();
        }
    }
    Ok(())
}

async fn connect(config: CacheConfig) -> Result<CacheService> {
    CacheService::initialize(config)
        .await
        .context("initializing cache service")
}

/// Apply a `logging.level` changed on disk without restarting.
fn reload_log_level(path: Option<&str>, current: &mut String) {
    match load_config(path) {
        Ok(config) if config.logging.level != *current => {
            if observability::apply_logging_level(&config.logging.level) {
                tracing::info!(level = %config.logging.level, "logging level reloaded");
                *current = config.logging.level;
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "configuration reload failed, keeping current settings"),
    }
}

fn report(service: &CacheService) {
    let stats = service.statistics();
    tracing::info!(
        local_entries = stats.local.entries,
        local_hit_rate = stats.local.operations.hit_rate,
        overall_hit_rate = stats.overall_hit_rate,
        distributed_state = stats.distributed.state.map(|s| s.as_str()).unwrap_or("disabled"),
        "cache statistics"
    );

    if let Some(manager) = service.cluster_manager() {
        for cluster_id in manager.cluster_ids() {
            if let Err(e) = manager.verify_topology(&cluster_id) {
                tracing::warn!(cluster_id = %cluster_id, error = %e, "topology check failed");
            }
        }
    }
}

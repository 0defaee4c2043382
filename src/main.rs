//! Main entry point for the rating service
//!
//! This is the production entry point that loads configuration, initializes
//! logging, and runs the match pipeline until a shutdown signal arrives or
//! the pipeline stops on a fatal error.

use anyhow::Result;
use clap::Parser;
use rating_service::config::{validate_config, AppConfig};
use rating_service::service::RatingService;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

/// Rating Service - TrueSkill ratings for finished matches
#[derive(Parser)]
#[command(
    name = "rating-service",
    version,
    about = "Consumes finished-match results and maintains TrueSkill leaderboard ratings",
    long_about = "The rating service subscribes to finished-match results over AMQP, updates \
                 each participant's TrueSkill rating on the match's leaderboard, and keeps \
                 rating history, leaderboard ordering and inactivity decay in a SQLite store."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// AMQP URL override
    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    /// Database URL override
    #[arg(
        long,
        value_name = "URL",
        help = "Override rating database URL (`memory` for an in-process store)"
    )]
    database_url: Option<String>,

    /// Health port override
    #[arg(long, value_name = "PORT", help = "Override health and metrics port")]
    health_port: Option<u16>,

    /// Run without a broker
    #[arg(
        long,
        help = "Start without connecting to the broker; no match results are consumed"
    )]
    dry_run: bool,

    /// Run one maintenance pass and exit
    #[arg(
        long,
        value_name = "LEADERBOARD",
        num_args = 0..=1,
        help = "Decay inactive players (on one leaderboard, or all) and exit"
    )]
    decay_now: Option<Option<String>>,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

fn display_startup_banner(config: &AppConfig, dry_run: bool) {
    info!("Rating Service {}", rating_service::VERSION);
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    info!("   Database: {}", config.database.url);
    if dry_run {
        info!("   AMQP: disabled (dry run)");
    } else {
        info!("   AMQP: {}", config.amqp.url);
        info!(
            "   Queue: {} <- {} ({})",
            config.amqp.queue_name, config.amqp.exchange_name, config.amqp.routing_key
        );
    }
    info!(
        "   Workers: {}",
        config.processing.max_concurrent_matches
    );
    info!(
        "   Maintenance: {}",
        if config.maintenance.enabled {
            format!("every {}s", config.maintenance.interval_seconds)
        } else {
            "on demand".to_string()
        }
    );
}

/// Load and merge configuration from file or environment and CLI arguments
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    // Apply CLI overrides
    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }
    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
    }
    if let Some(database_url) = &args.database_url {
        config.database.url = database_url.clone();
    }
    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }

    validate_config(&config)?;
    Ok(config)
}

async fn run_decay_now(config: AppConfig, leaderboard: Option<String>) -> Result<()> {
    let mut service = RatingService::new(config).await?;
    let report = service.run_maintenance(leaderboard.as_ref()).await;
    service.shutdown().await?;

    let report = report?;
    info!(
        leaderboards = report.leaderboards,
        examined = report.examined,
        decayed = report.decayed,
        failed = report.failed,
        "Maintenance pass completed"
    );
    if report.failed > 0 {
        anyhow::bail!("{} players could not be decayed", report.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Some(leaderboard) = args.decay_now.clone() {
        return run_decay_now(config, leaderboard).await;
    }

    display_startup_banner(&config, args.dry_run);

    info!("Initializing service components...");
    let mut service = match RatingService::new(config).await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to initialize service: {:#}", e);
            std::process::exit(1);
        }
    };

    if !args.dry_run {
        if let Err(e) = service.connect_broker().await {
            error!("Failed to connect to broker: {:#}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = service.start().await {
        error!("Failed to start service: {:#}", e);
        let _ = service.shutdown().await;
        std::process::exit(1);
    }
    service.serve_health();

    info!("Rating service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    let pipeline_stopped = service.pipeline_stopped();
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("Shutdown signal received, beginning graceful shutdown...");
        }
        _ = pipeline_stopped => {
            warn!("Match pipeline stopped, shutting down");
        }
    }

    match service.shutdown().await {
        Ok(summary) => {
            info!(
                committed = summary.committed,
                duplicates = summary.duplicates,
                rejected = summary.rejected,
                "Graceful shutdown completed"
            );
            Ok(())
        }
        Err(e) => {
            error!("Service stopped with error: {:#}", e);
            std::process::exit(1);
        }
    }
}

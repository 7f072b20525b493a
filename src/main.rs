//! arenad - realtime backend daemon for multiplayer applications.
//!
//! Sessions, presence-addressable streams, authoritative matches, parties,
//! matchmaking, and scheduled tournaments, clustered over a peer-to-peer
//! delta protocol.

mod chat;
mod cluster;
mod config;
mod db;
mod error;
mod http;
mod matches;
mod matchmaker;
mod metrics;
mod nexus;
mod pipeline;
mod router;
mod runtime;
mod scheduler;
mod session;
mod tracker;

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::nexus::Nexus;
use crate::pipeline::Pipeline;
use crate::runtime::{BuiltinProvider, RuntimeProvider};
use crate::session::Gateway;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(2);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use log_format).
    let config_path = resolve_config_path();

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
            std::process::exit(2);
        }
    };

    // Initialize tracing based on config.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match config.server.log_format {
        crate::config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        crate::config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    // Validate configuration; an invalid file is exit code 2.
    if let Err(errors) = crate::config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        std::process::exit(2);
    }

    info!(
        node = %config.server.name,
        realtime = %config.listen.realtime_addr,
        "Starting arenad"
    );

    // Initialize database when configured.
    let database = match &config.database {
        Some(db_config) => Some(db::Database::new(&db_config.path).await?),
        None => {
            info!("No database configured, chat persistence and user lookups disabled");
            None
        }
    };

    // Shutdown propagation for every background task.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM - initiating graceful shutdown"),
            }
            shutdown.cancel();
        });
    }

    // Prometheus metrics are optional.
    // Convention: metrics_port = 0 disables the HTTP endpoint (used by tests).
    let metrics_port = config.server.metrics_port.unwrap_or(9090);
    if metrics_port == 0 {
        info!("Metrics disabled");
    } else {
        metrics::init();
        tokio::spawn(async move {
            http::run_http_server(metrics_port).await;
        });
        info!(port = metrics_port, "Prometheus HTTP server started");
    }

    // Providers in priority order. Game modules compile in here.
    let providers: Vec<Box<dyn RuntimeProvider>> =
        vec![Box::new(BuiltinProvider::new(config.server.name.clone()))];

    let (nexus, channels) = Nexus::new(&config, database, providers, shutdown.clone())?;
    nexus.start(&config, channels);

    // Register scheduled tournaments and leaderboards (ids and cron
    // patterns were validated with the config).
    for tournament in &config.tournaments {
        let id = uuid::Uuid::parse_str(&tournament.id)?;
        nexus
            .scheduler
            .add_tournament(
                id,
                tournament.cron.as_deref(),
                tournament.start_time,
                tournament.duration,
                tournament.end_time,
            )
            .map_err(|e| anyhow::anyhow!("tournament {id}: {e}"))?;
    }
    for board in &config.leaderboards {
        let id = uuid::Uuid::parse_str(&board.id)?;
        nexus
            .scheduler
            .add_leaderboard(id, &board.cron)
            .map_err(|e| anyhow::anyhow!("leaderboard {id}: {e}"))?;
    }
    if !config.tournaments.is_empty() || !config.leaderboards.is_empty() {
        info!(
            tournaments = config.tournaments.len(),
            leaderboards = config.leaderboards.len(),
            "Scheduled entities registered"
        );
    }

    let pipeline = Pipeline::new(nexus.clone());
    let gateway = Gateway::bind(&config.listen.realtime_addr, Arc::clone(&nexus), pipeline).await?;
    gateway.run().await?;

    info!("Gateway stopped, waiting for tasks to finish...");
    // Give tasks a moment to flush buffers and close connections.
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

    Ok(())
}

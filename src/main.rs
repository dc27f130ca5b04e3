mod branch;
mod bus;
mod cli;
mod collections;
mod config;
mod crypto;
mod domain;
mod embeddings;
mod error;
mod fingerprint;
mod logging;
mod paths;
mod registry;
mod scrub;
mod server;
mod util;
mod vectorstore;

use crate::branch::BranchEngine;
use crate::bus::EventBus;
use crate::collections::CollectionManager;
use crate::config::Config;
use crate::domain::{CheckpointService, RemediationService, SkillService};
use crate::embeddings::EmbeddingGateway;
use crate::registry::SessionRegistry;
use crate::scrub::ScrubberCache;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "contextd", version)]
#[command(about = "contextd — persistent working memory for AI coding agents", long_about = None)]
struct Cli {
    /// Port for the MCP server
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP server (default)
    Serve,
    /// Diagnose configuration and backend reachability
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_path) = Config::load_with_path().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config, using defaults: {e}");
        (Config::default(), None)
    });

    let cli = Cli::parse();

    // Doctor runs without tracing so its report stays clean.
    if let Some(Command::Doctor) = &cli.cmd {
        return cli::doctor::run(&config, config_path.as_deref()).await;
    }

    let log_dir = match logging::setup_tracing(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
    }) {
        Ok(path) => Some(path),
        Err(err) => {
            eprintln!("Failed to initialize logging: {err}");
            None
        }
    };

    let port = cli.port.unwrap_or(config.server.port);

    tracing::info!("--- contextd startup ---");
    match config_path.as_ref() {
        Some(path) => tracing::info!("Config File: {}", path.display()),
        None => tracing::info!("Config File: (default)"),
    }
    if let Some(dir) = log_dir.as_ref() {
        tracing::info!("Log Directory: {}", dir.display());
    }
    tracing::info!(
        "Vector Store: {} ({})",
        config.vectorstore.provider,
        config.vectorstore.url
    );
    tracing::info!(
        "Embeddings: {} model={} dim={}",
        config.embeddings.provider,
        config.embeddings.model,
        config.embeddings.dim
    );
    tracing::info!(
        "Context Limit: {} tokens, thresholds {:?}",
        config.branching.context_limit_tokens,
        config.branching.thresholds
    );
    tracing::info!("------------------------");

    if config.bus.backend != "memory" {
        tracing::warn!(
            "bus backend {:?} is not built in; using the in-process bus",
            config.bus.backend
        );
    }

    let store = vectorstore::from_config(&config.vectorstore)?;
    let gateway = Arc::new(EmbeddingGateway::from_config(&config.embeddings)?);
    let cm = Arc::new(CollectionManager::new(store, config.embeddings.dim));
    let bus = Arc::new(EventBus::new(config.bus.capacity));
    let registry = Arc::new(SessionRegistry::new());
    let scrubbers = Arc::new(ScrubberCache::new(config.security.secret_scrubbing.clone()));

    let checkpoints = Arc::new(CheckpointService::new(
        cm.clone(),
        gateway.clone(),
        bus.clone(),
        scrubbers.clone(),
    ));
    let remediations = Arc::new(RemediationService::new(
        cm.clone(),
        gateway.clone(),
        bus.clone(),
        scrubbers.clone(),
    ));
    let skills = Arc::new(SkillService::new(
        cm.clone(),
        gateway.clone(),
        bus.clone(),
        scrubbers.clone(),
    ));
    let engine = Arc::new(BranchEngine::new(
        registry.clone(),
        cm,
        gateway,
        bus.clone(),
        scrubbers,
        checkpoints.clone(),
        config.branching.clone(),
        config.auto_checkpoint.clone(),
        config.security.secret_scrubbing.clone(),
    ));

    let state = Arc::new(server::AppState::new(
        engine,
        checkpoints,
        remediations,
        skills,
        bus,
        registry,
        config.limits.clone(),
    ));

    server::start_server(state, port).await
}

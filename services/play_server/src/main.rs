//! Play Server Binary

use anyhow::{Context, Result};
use clap::Parser;
use node_config::NodeConfig;
use play_server::{echo, PlayServer};
use stage_actors::StageRegistry;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "play_server")]
#[command(about = "PlayMesh play node")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured server id
    #[arg(long)]
    server_id: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("Invalid log_level {:?}", config.log_level))?,
    };
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!(config = ?args.config, log_level = %config.log_level, "Configuration loaded");

    if let Some(server_id) = args.server_id {
        config.server_id = server_id;
    }
    if config.stage.default_stage_type.is_empty() {
        config.stage.default_stage_type = echo::ECHO_STAGE_TYPE.to_string();
    }

    let mut registry = StageRegistry::new();
    echo::register(&mut registry);

    let server = PlayServer::start(config, registry).await?;
    info!(
        server_id = %server.server_id(),
        mesh = %server.mesh_addr(),
        sessions = %server.session_addr(),
        "Play server running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}

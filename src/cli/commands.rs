//! CLI command implementations

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::bus::LocalBus;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::observability::init_logging;
use crate::socket::{SocketServer, TokenVerifier};
use crate::store::MemoryStore;

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config } => serve(&config),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Validate a config file, printing the effective configuration
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = EngineConfig::load(config_path)?;
    let effective = serde_json::to_string_pretty(&config)
        .map_err(|e| CliError::config_error(e.to_string()))?;
    println!("{}", effective);
    Ok(())
}

/// Run the engine over an in-memory store and local bus until Ctrl-C
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = EngineConfig::load(config_path)?;
    init_logging(config.log.format, &config.log.level)?;

    let verifier = TokenVerifier::from_config(&config.auth)
        .ok_or_else(|| CliError::config_error("auth.secret is required to serve sockets"))?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::serve_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async move {
        let socket_config = config.socket.clone();
        let engine = Arc::new(Engine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBus::default()),
        ));
        engine.start().await?;

        let server = Arc::new(SocketServer::new(Arc::clone(&engine), verifier, socket_config));
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
            }
            finished = serving => {
                if let Ok(Err(e)) = finished {
                    engine.shutdown().await?;
                    return Err(CliError::from(e));
                }
            }
        }

        server.shutdown();
        engine.shutdown().await?;
        info!(metrics = ?engine.metrics(), "Stopped");
        Ok(())
    })
}

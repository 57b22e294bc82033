//! Realtime Relay - WebSocket bridge to a streaming AI provider
//!
//! Pairs each browser connection with one upstream provider connection and
//! mints ephemeral client secrets so the provider key stays server-side.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use realtime_relay::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load the configuration, print a summary, and report validity
fn run_check_config(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => {
            println!("Configuration OK");
            println!("  listen:       {}:{}", config.server.host, config.server.port);
            println!("  upstream:     {}", config.provider.realtime_url);
            println!("  model:        {}", config.provider.model);
            println!(
                "  credential:   {}",
                if config.provider.resolve_api_key().is_some() {
                    "resolved"
                } else {
                    "NOT RESOLVED (sessions will be refused)"
                }
            );
            println!(
                "  origins:      {}",
                if config.relay.allowed_origins.is_empty() {
                    "any (no allowlist)".to_string()
                } else {
                    config.relay.allowed_origins.join(", ")
                }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> realtime_relay::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

/// Run the relay server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        model = %config.provider.model,
        "Starting realtime relay"
    );

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Relay shutdown complete");
    ExitCode::SUCCESS
}

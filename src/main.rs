//! Token Broker - session tokens, service-account PATs and linked OAuth accounts

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use token_broker::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    keys::generate_key_file,
    setup_tracing,
    token::service_account::hash_secret,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::HashSecret { ref secret }) => {
            println!("{}", hash_secret(secret));
            ExitCode::SUCCESS
        }
        Some(Command::GenerateKey { ref output }) => run_generate_key(output).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Write a new signing key
async fn run_generate_key(output: &Path) -> ExitCode {
    match generate_key_file(output).await {
        Ok(kid) => {
            println!("Wrote signing key {kid} to {}", output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to generate key: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the token broker
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if cli.dev {
                config.dev.enabled = true;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        providers = config.providers.len(),
        dev = config.dev.enabled,
        "Starting token broker"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create token broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Token broker error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Token broker shutdown complete");
    ExitCode::SUCCESS
}

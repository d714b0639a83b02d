//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Token broker - session tokens, service-account PATs and linked OAuth accounts
#[derive(Parser, Debug)]
#[command(name = "token-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOKEN_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOKEN_BROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOKEN_BROKER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOKEN_BROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOKEN_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Enable development mode (`GET /token/generate`)
    #[arg(long, env = "TOKEN_BROKER_DEV")]
    pub dev: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the token broker (default)
    Serve,

    /// Print the `sha256:<hex>` digest of a service-account secret for configuration
    HashSecret {
        /// The secret to hash
        #[arg(required = true)]
        secret: String,
    },

    /// Generate a PKCS#8 PEM signing key
    GenerateKey {
        /// File to write (must not exist)
        #[arg(short, long, required = true)]
        output: PathBuf,
    },
}

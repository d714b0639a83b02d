//! Token Broker Library
//!
//! Identity and token gateway between a local identity store, an external
//! OAuth identity provider and third-party resource providers.
//!
//! # Features
//!
//! - **Signed tokens**: ES256 session tokens and service-account PATs, with
//!   key rotation and JWKS export
//! - **Account linking**: OAuth2 authorization-code flow with single-use
//!   anti-CSRF state, chained across several providers
//! - **External tokens**: stored per (identity, resource), refreshed on demand
//! - **Failsafes**: Deadlines, bounded retries and a circuit breaker per provider
//! - **Audit trail**: every token lifecycle transition as a structured event

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod external_token;
pub mod failsafe;
pub mod gateway;
pub mod keys;
pub mod link;
pub mod token;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}

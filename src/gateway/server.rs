//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::router::{AppState, IdentityProvider, create_router};
use crate::audit::{self, AuditEvent};
use crate::config::{Config, StorageBackend};
use crate::external_token::{
    ExternalTokenStore, FileExternalTokenStore, InMemoryExternalTokenStore,
};
use crate::keys::KeyStore;
use crate::link::{LinkService, StateStore};
use crate::token::{ServiceAccountAuthenticator, TokenIssuer};
use crate::upstream::{Provider, ProviderRegistry, UpstreamClient};
use crate::{Error, Result};

/// Wire every component from configuration.
pub async fn build_state(config: &Config) -> Result<Arc<AppState>> {
    let keys = Arc::new(
        KeyStore::load_or_generate(
            config.keys.private_key_path.as_deref(),
            config.max_token_lifetime(),
            config.tokens.clock_skew,
        )
        .await?,
    );
    let issuer = Arc::new(TokenIssuer::new(Arc::clone(&keys), &config.tokens));
    let service_accounts = Arc::new(ServiceAccountAuthenticator::from_config(
        Arc::clone(&issuer),
        &config.service_accounts,
    )?);

    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
    let providers = Arc::new(ProviderRegistry::from_config(&config.providers)?);

    let tokens: Arc<dyn ExternalTokenStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryExternalTokenStore::new()),
        StorageBackend::File => {
            let dir = config.storage.directory().ok_or_else(|| {
                Error::Config("storage.directory is required for the file backend".to_string())
            })?;
            Arc::new(FileExternalTokenStore::new(dir).await?)
        }
    };

    let links = Arc::new(LinkService::new(
        StateStore::in_memory(config.link.state_ttl),
        Arc::clone(&providers),
        Arc::clone(&upstream),
        tokens,
        &config.link,
        config.server.callback_url(),
        config.upstream.deadline,
    )?);

    let idp = config
        .idp
        .as_ref()
        .map(|idp| {
            Ok::<_, Error>(IdentityProvider {
                provider: Arc::new(Provider::from_config(&idp.provider)?),
                delegate_client_credentials: idp.delegate_client_credentials,
            })
        })
        .transpose()?;

    Ok(Arc::new(AppState {
        keys,
        issuer,
        service_accounts,
        links,
        upstream,
        idp,
        public_url: config.server.public_url.clone(),
        dev: config.dev.clone(),
        upstream_deadline: config.upstream.deadline,
        request_timeout: config.server.request_timeout,
    }))
}

/// Token broker server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    pub async fn new(config: Config) -> Result<Self> {
        let state = build_state(&config).await?;
        Ok(Self { config, state })
    }

    /// Shared state, for embedding the router elsewhere.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run the gateway until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("TOKEN BROKER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(public_url = %self.config.server.public_url, "Public URL");
        info!(
            providers = self.state.links.providers().len(),
            service_accounts = self.config.service_accounts.len(),
            idp = self.state.idp.is_some(),
            kid = %self.state.keys.active_key().kid(),
            "Components ready"
        );
        if self.config.dev.enabled {
            warn!("DEVELOPMENT MODE - GET /token/generate mints tokens without credentials");
        }
        info!("============================================================");

        let maintenance = tokio::spawn(maintenance_loop(
            Arc::clone(&self.state),
            self.config.clone(),
            shutdown_tx.subscribe(),
        ));

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if tokio::time::timeout(self.config.server.shutdown_timeout, maintenance)
            .await
            .is_err()
        {
            warn!("Maintenance task did not stop in time");
        }
        info!("Token broker stopped");
        Ok(())
    }
}

/// Purge keys and reap expired records; rotate keys when configured.
async fn maintenance_loop(
    state: Arc<AppState>,
    config: Config,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut maintenance = tokio::time::interval(config.keys.maintenance_interval);
    // Rotation starts one period from now; a plain interval would fire immediately
    let mut rotation = config.keys.rotation_interval.and_then(|period| {
        let start = tokio::time::Instant::now().checked_add(period)?;
        Some(tokio::time::interval_at(start, period))
    });

    loop {
        tokio::select! {
            _ = maintenance.tick() => run_maintenance(&state).await,
            () = next_rotation(rotation.as_mut()) => rotate_key(&state),
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("Maintenance loop stopped");
}

async fn next_rotation(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// One maintenance pass.
pub async fn run_maintenance(state: &AppState) {
    for kid in state.keys.purge(Utc::now()) {
        audit::emit(&AuditEvent::key_purged(&kid));
    }

    let states = state.links.reap_expired_states().await;
    let refresh_records = state.issuer.reap_used_refresh_tokens();
    if states > 0 || refresh_records > 0 {
        debug!(states, refresh_records, "Maintenance pass");
    }
}

fn rotate_key(state: &AppState) {
    match state.keys.rotate() {
        Ok(key) => audit::emit(&AuditEvent::key_rotated(key.kid())),
        Err(e) => warn!(error = %e, "Scheduled key rotation failed"),
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

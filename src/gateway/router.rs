//! HTTP route table

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::auth::auth_middleware;
use super::handlers;
use crate::config::DevConfig;
use crate::keys::KeyStore;
use crate::link::LinkService;
use crate::token::{ServiceAccountAuthenticator, TokenIssuer};
use crate::upstream::{Provider, UpstreamClient};

/// Identity provider used by `POST /token`
pub struct IdentityProvider {
    /// Resolved provider
    pub provider: Arc<Provider>,
    /// Forward unknown `client_credentials` clients to the provider
    pub delegate_client_credentials: bool,
}

/// Shared application state
pub struct AppState {
    /// Signing keys
    pub keys: Arc<KeyStore>,
    /// Session and PAT issuance
    pub issuer: Arc<TokenIssuer>,
    /// Local service accounts
    pub service_accounts: Arc<ServiceAccountAuthenticator>,
    /// Account linking and external tokens
    pub links: Arc<LinkService>,
    /// Upstream OAuth client
    pub upstream: Arc<UpstreamClient>,
    /// Identity provider, when configured
    pub idp: Option<IdentityProvider>,
    /// Externally reachable base URL
    pub public_url: String,
    /// Development mode settings
    pub dev: DevConfig,
    /// Deadline for upstream work within one request
    pub upstream_deadline: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth = middleware::from_fn_with_state(Arc::clone(&state), auth_middleware);

    Router::new()
        .route("/health", get(health_handler))
        // GET and DELETE need a bearer token; POST authenticates with client credentials
        .route(
            "/token",
            get(handlers::get_external_token)
                .delete(handlers::delete_external_token)
                .route_layer(auth.clone())
                .post(handlers::token_endpoint),
        )
        .route("/token/keys", get(handlers::public_keys))
        .route("/token/generate", get(handlers::generate_dev_tokens))
        .route("/token/refresh", post(handlers::refresh_session))
        .route("/token/link", get(handlers::start_link).route_layer(auth))
        .route("/token/link/callback", get(handlers::link_callback))
        .fallback(handlers::not_found)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

//! Bearer-token authentication for protected endpoints
//!
//! The middleware verifies the broker-signed bearer token and inserts the
//! resulting [`Caller`] into the request extensions. Handlers take the
//! caller as an `Extension` argument instead of reading ambient state.
//!
//! Every rejection looks the same to the client (401, `invalid or expired
//! token`); the precise reason goes to the log, the audit trail and the
//! `token_verification_failures_total` counter.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::router::AppState;
use crate::audit::{self, AuditEvent};
use crate::keys::KeyError;
use crate::token::{Claims, TokenKind};
use crate::Error;

/// Authenticated caller of a protected endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Identity id (service-account client id for PATs)
    pub identity_id: String,
    /// Kind of token presented
    pub kind: TokenKind,
    /// Service account name, for PATs
    pub service_account: Option<String>,
}

impl From<Claims> for Caller {
    fn from(claims: Claims) -> Self {
        Self {
            identity_id: claims.sub,
            kind: claims.token_kind,
            service_account: claims.service_account,
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = bearer_token(request.headers()) else {
        debug!(path = %path, "Missing Authorization header");
        record_rejection("missing_token");
        return unauthorized(Error::Unauthorized(
            "Missing Authorization header. Use: Authorization: Bearer <token>".to_string(),
        ));
    };

    match state.issuer.verify_access_token(token) {
        Ok(claims) => {
            let caller = Caller::from(claims);
            debug!(identity = %caller.identity_id, kind = ?caller.kind, path = %path, "Authenticated request");
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, reason = e.reason(), error = %e, "Token rejected");
            record_rejection(e.reason());
            unauthorized(rejection(e))
        }
    }
}

fn rejection(error: KeyError) -> Error {
    if error.is_verification_failure() {
        Error::Key(error)
    } else {
        // Server-side key faults still must not let the request through
        Error::Key(KeyError::InvalidClaims(error.to_string()))
    }
}

fn record_rejection(reason: &'static str) {
    telemetry_metrics::counter!("token_verification_failures_total", "reason" => reason)
        .increment(1);
    audit::emit(&AuditEvent::token_rejected(reason));
}

fn unauthorized(error: Error) -> Response {
    let mut response = error.into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_extracted_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn caller_carries_service_account_name() {
        let caller = Caller::from(Claims {
            jti: "j".to_string(),
            iss: "i".to_string(),
            sub: "ci-bot".to_string(),
            iat: 0,
            exp: 1,
            token_kind: TokenKind::ServiceAccount,
            service_account: Some("ci".to_string()),
        });
        assert_eq!(caller.identity_id, "ci-bot");
        assert_eq!(caller.service_account.as_deref(), Some("ci"));
    }
}

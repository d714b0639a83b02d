//! Error types for the token broker

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::keys::KeyError;

/// Result type alias for the token broker
pub type Result<T> = std::result::Result<T, Error>;

/// Token broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or missing request input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing or rejected credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Link state token unknown or already consumed
    #[error("Link state not found or already used")]
    InvalidState,

    /// Link state token found but past its TTL
    #[error("Link state expired")]
    StateExpired,

    /// Upstream provider rejected the grant (bad code, revoked refresh token)
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Caller deadline elapsed while talking to the upstream provider
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Upstream provider failing (5xx, transport, open circuit)
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Signing key or token verification error
    #[error("Token error: {0}")]
    Key(#[from] KeyError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is reported with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::InvalidState | Self::StateExpired => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) | Self::InvalidGrant(_) => StatusCode::UNAUTHORIZED,
            Self::Key(e) if e.is_verification_failure() => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidState => "invalid_state",
            Self::StateExpired => "state_expired",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Key(e) if e.is_verification_failure() => "invalid_token",
            _ => "internal_error",
        }
    }

    /// Whether an upstream call failing with this error may be attempted again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamUnavailable(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Detail safe to return to the client.
    ///
    /// Verification failures collapse to one message so the response does not
    /// reveal which check failed. Internal failures hide their cause.
    fn public_detail(&self) -> String {
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR => match self {
                Self::UpstreamTimeout(_) | Self::UpstreamUnavailable(_) => self.to_string(),
                _ => "internal server error".to_string(),
            },
            _ => match self {
                Self::Key(_) => "invalid or expired token".to_string(),
                _ => self.to_string(),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = json!({
            "errors": [{
                "status": status.as_u16().to_string(),
                "code": self.code(),
                "title": status.canonical_reason().unwrap_or("Error"),
                "detail": self.public_detail(),
            }]
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(Error::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::InvalidState.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::StateExpired.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::InvalidGrant("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::UpstreamTimeout("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::Internal("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn verification_failures_share_one_public_detail() {
        // GIVEN: two different verification failures
        let expired = Error::Key(KeyError::TokenExpired);
        let unknown = Error::Key(KeyError::UnknownKey("abc".into()));

        // THEN: both are 401 with identical detail
        assert_eq!(expired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(expired.public_detail(), unknown.public_detail());
        assert!(!unknown.public_detail().contains("abc"));
    }

    #[test]
    fn signing_failure_is_internal() {
        let err = Error::Key(KeyError::Signing("boom".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_detail(), "internal server error");
    }

    #[test]
    fn invalid_state_message_mentions_not_found() {
        assert!(Error::InvalidState.to_string().contains("not found"));
    }

    #[test]
    fn only_upstream_unavailable_is_retryable() {
        assert!(Error::UpstreamUnavailable("503".into()).is_retryable());
        assert!(!Error::InvalidGrant("bad code".into()).is_retryable());
        assert!(!Error::UpstreamTimeout("deadline".into()).is_retryable());
    }
}

//! Audit logging for token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the event serialized as
//! JSON in the `audit` field, so the trail can be queried by any log
//! aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `session.issued` | A session token pair is minted |
//! | `session.refreshed` | A refresh token is exchanged for a new pair |
//! | `pat.issued` | A service account obtains a PAT |
//! | `pat.denied` | Service-account credentials are rejected |
//! | `token.rejected` | A bearer token fails verification |
//! | `link.started` | An account-link flow is started |
//! | `link.completed` | A callback stored an external token |
//! | `link.failed` | A callback ended in the failure redirect |
//! | `external.deleted` | A stored external token is removed |
//! | `key.rotated` | A new signing key becomes active |
//! | `key.purged` | A retired signing key is dropped |

use serde::Serialize;

/// Structured audit event
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type (e.g. `"link.completed"`)
    pub event: &'static str,
    /// Identity or service-account client id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Resource URL, for link and external-token events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Key id, for key events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Service account name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// Reason for denial, rejection or failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// `session.issued`
    #[must_use]
    pub fn session_issued(identity_id: &str) -> Self {
        Self {
            event: "session.issued",
            subject: Some(identity_id.to_string()),
            ..Self::default()
        }
    }

    /// `session.refreshed`
    #[must_use]
    pub fn session_refreshed() -> Self {
        Self {
            event: "session.refreshed",
            ..Self::default()
        }
    }

    /// `pat.issued`
    #[must_use]
    pub fn pat_issued(client_id: &str, name: &str) -> Self {
        Self {
            event: "pat.issued",
            subject: Some(client_id.to_string()),
            service_account: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// `pat.denied`
    #[must_use]
    pub fn pat_denied(client_id: &str, reason: &str) -> Self {
        Self {
            event: "pat.denied",
            subject: Some(client_id.to_string()),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// `token.rejected`, carrying the internal verification reason.
    #[must_use]
    pub fn token_rejected(reason: &str) -> Self {
        Self {
            event: "token.rejected",
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// `link.started`
    #[must_use]
    pub fn link_started(identity_id: &str, resource: &str) -> Self {
        Self {
            event: "link.started",
            subject: Some(identity_id.to_string()),
            resource: Some(resource.to_string()),
            ..Self::default()
        }
    }

    /// `link.completed`
    #[must_use]
    pub fn link_completed(identity_id: &str, resource: &str) -> Self {
        Self {
            event: "link.completed",
            subject: Some(identity_id.to_string()),
            resource: Some(resource.to_string()),
            ..Self::default()
        }
    }

    /// `link.failed`; identity and resource are unknown when the state was invalid.
    #[must_use]
    pub fn link_failed(identity_id: Option<&str>, resource: Option<&str>, reason: &str) -> Self {
        Self {
            event: "link.failed",
            subject: identity_id.map(str::to_string),
            resource: resource.map(str::to_string),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// `external.deleted`
    #[must_use]
    pub fn external_deleted(identity_id: &str, resource: &str, reason: &str) -> Self {
        Self {
            event: "external.deleted",
            subject: Some(identity_id.to_string()),
            resource: Some(resource.to_string()),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// `key.rotated`
    #[must_use]
    pub fn key_rotated(kid: &str) -> Self {
        Self {
            event: "key.rotated",
            kid: Some(kid.to_string()),
            ..Self::default()
        }
    }

    /// `key.purged`
    #[must_use]
    pub fn key_purged(kid: &str) -> Self {
        Self {
            event: "key.purged",
            kid: Some(kid.to_string()),
            ..Self::default()
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO token_broker::audit audit={"event":"link.completed","subject":"alice",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "token-broker audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

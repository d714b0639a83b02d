//! Linked third-party credentials, keyed by (identity, resource).
//!
//! [`ExternalTokenStore::upsert`] replaces any existing entry for the same
//! key, so concurrent links of one resource converge on a single entry.

mod file;
mod memory;

pub use file::FileExternalTokenStore;
pub use memory::InMemoryExternalTokenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::upstream::OAuthToken;

/// A third-party OAuth credential linked to an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalToken {
    /// Owning identity
    pub identity_id: String,
    /// Canonical resource URL of the provider
    pub resource: String,
    /// Access token
    pub access_token: String,
    /// Refresh token, when the provider issued one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: String,
    /// Token type
    pub token_type: String,
    /// Expiry, when known
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    /// Username at the provider
    #[serde(default)]
    pub username: Option<String>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl ExternalToken {
    /// Build from an upstream token; `requested_scope` fills in when the
    /// provider did not echo the granted scope.
    #[must_use]
    pub fn from_oauth(
        identity_id: &str,
        resource: &str,
        token: OAuthToken,
        requested_scope: &str,
    ) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            resource: resource.to_string(),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            scope: token.scope.unwrap_or_else(|| requested_scope.to_string()),
            token_type: token.token_type,
            expiry: token.expiry,
            username: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply a refreshed upstream token, keeping identity, resource and username.
    #[must_use]
    pub fn refreshed(self, token: OAuthToken) -> Self {
        Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(self.refresh_token),
            scope: token.scope.unwrap_or(self.scope),
            token_type: token.token_type,
            expiry: token.expiry,
            updated_at: Utc::now(),
            ..self
        }
    }

    /// Same expiry rule as [`OAuthToken::is_expired`].
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        OAuthToken {
            access_token: String::new(),
            expiry: self.expiry,
            refresh_token: None,
            token_type: String::new(),
            scope: None,
        }
        .is_expired(now)
    }

    /// Response body of `GET /token`.
    #[must_use]
    pub fn document(&self) -> ExternalTokenDocument {
        ExternalTokenDocument {
            access_token: self.access_token.clone(),
            scope: self.scope.clone(),
            token_type: self.token_type.clone(),
            username: self.username.clone(),
        }
    }
}

/// Externally visible view of a linked token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTokenDocument {
    /// Access token
    pub access_token: String,
    /// Granted scope
    pub scope: String,
    /// Token type
    pub token_type: String,
    /// Username at the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Storage for linked tokens.
#[async_trait::async_trait]
pub trait ExternalTokenStore: Send + Sync + 'static {
    /// Insert or replace the token for `(token.identity_id, token.resource)`.
    async fn upsert(&self, token: ExternalToken) -> Result<()>;

    /// Token for `(identity_id, resource)`, if linked.
    async fn get(&self, identity_id: &str, resource: &str) -> Result<Option<ExternalToken>>;

    /// Remove the token. Returns whether one existed.
    async fn delete(&self, identity_id: &str, resource: &str) -> Result<bool>;
}

//! Mints and verifies the broker's own signed tokens.
//!
//! Three kinds share one claim set, distinguished by `token_kind`:
//!
//! | Kind | Lifetime | Accepted by |
//! |------|----------|-------------|
//! | `access` | `tokens.access_token_ttl` | protected endpoints |
//! | `refresh` | `tokens.refresh_token_ttl` | `POST /token/refresh` only |
//! | `service_account` | `tokens.service_account_token_ttl` | protected endpoints |

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{RefreshPolicy, TokensConfig};
use crate::keys::{KeyError, KeyStore, TimeBoundClaims};
use crate::{Error, Result};

/// Which kind of token a claim set describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Session access token
    Access,
    /// Session refresh token
    Refresh,
    /// Service-account personal access token
    ServiceAccount,
}

/// Claims of every token the broker signs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Unique token id
    pub jti: String,
    /// Issuer
    pub iss: String,
    /// Identity id (or service-account client id)
    pub sub: String,
    /// Issued at (seconds since epoch)
    pub iat: i64,
    /// Expires at (seconds since epoch)
    pub exp: i64,
    /// Token kind
    pub token_kind: TokenKind,
    /// Service account name, for PATs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

impl TimeBoundClaims for Claims {
    fn issued_at(&self) -> i64 {
        self.iat
    }

    fn expires_at(&self) -> i64 {
        self.exp
    }
}

/// Token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// Signed access token
    pub access_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds (0 when no refresh token is issued)
    pub refresh_expires_in: u64,
    /// Signed refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Always `Bearer`
    pub token_type: String,
    /// Keycloak-compatible not-before policy
    #[serde(rename = "not-before-policy", default)]
    pub not_before_policy: i64,
}

/// Response body of the session token endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Token payload
    pub token: TokenData,
}

/// Issues session tokens and service-account PATs
pub struct TokenIssuer {
    keys: Arc<KeyStore>,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    service_account_ttl: Duration,
    refresh_policy: RefreshPolicy,
    /// Refresh-token jti → exp, for single-use refresh tokens
    used_refresh: DashMap<String, i64>,
}

impl TokenIssuer {
    /// Create an issuer signing with `keys`.
    #[must_use]
    pub fn new(keys: Arc<KeyStore>, config: &TokensConfig) -> Self {
        Self {
            keys,
            issuer: config.issuer.clone(),
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
            service_account_ttl: config.service_account_token_ttl,
            refresh_policy: config.refresh_policy,
            used_refresh: DashMap::new(),
        }
    }

    /// Underlying key store.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    fn mint(
        &self,
        subject: &str,
        kind: TokenKind,
        ttl: Duration,
        service_account: Option<&str>,
    ) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            iat,
            exp: iat.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
            token_kind: kind,
            service_account: service_account.map(str::to_string),
        };
        Ok(self.keys.sign(&claims)?)
    }

    /// Access + refresh token pair for `identity_id`.
    pub fn issue_session_token(&self, identity_id: &str) -> Result<AuthToken> {
        if identity_id.trim().is_empty() {
            return Err(Error::BadRequest("identity id must not be empty".to_string()));
        }

        let access_token = self.mint(identity_id, TokenKind::Access, self.access_ttl, None)?;
        let refresh_token = self.mint(identity_id, TokenKind::Refresh, self.refresh_ttl, None)?;

        Ok(AuthToken {
            token: TokenData {
                access_token,
                expires_in: self.access_ttl.as_secs(),
                refresh_expires_in: self.refresh_ttl.as_secs(),
                refresh_token: Some(refresh_token),
                token_type: "Bearer".to_string(),
                not_before_policy: 0,
            },
        })
    }

    /// Verify a refresh token and issue a new pair for its subject.
    pub fn refresh_session_token(&self, refresh_token: &str) -> Result<AuthToken> {
        let claims: Claims = self.keys.verify(refresh_token)?;
        if claims.token_kind != TokenKind::Refresh {
            return Err(KeyError::InvalidClaims("not a refresh token".to_string()).into());
        }

        if self.refresh_policy == RefreshPolicy::SingleUse {
            match self.used_refresh.entry(claims.jti.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::Unauthorized(
                        "refresh token has already been used".to_string(),
                    ));
                }
                Entry::Vacant(slot) => {
                    slot.insert(claims.exp);
                }
            }
        }

        self.issue_session_token(&claims.sub)
    }

    /// PAT for a service account. No refresh token is issued.
    pub fn issue_service_account_token(&self, account: &super::ServiceAccount) -> Result<AuthToken> {
        let access_token = self.mint(
            &account.client_id,
            TokenKind::ServiceAccount,
            self.service_account_ttl,
            Some(&account.name),
        )?;

        Ok(AuthToken {
            token: TokenData {
                access_token,
                expires_in: self.service_account_ttl.as_secs(),
                refresh_expires_in: 0,
                refresh_token: None,
                token_type: "Bearer".to_string(),
                not_before_policy: 0,
            },
        })
    }

    /// Verify a token presented to a protected endpoint.
    ///
    /// Refresh tokens are rejected: they are only good for refreshing.
    pub fn verify_access_token(&self, token: &str) -> std::result::Result<Claims, KeyError> {
        let claims: Claims = self.keys.verify(token)?;
        if claims.token_kind == TokenKind::Refresh {
            return Err(KeyError::InvalidClaims(
                "refresh tokens cannot be used for access".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Forget used refresh-token ids whose tokens have expired anyway.
    pub fn reap_used_refresh_tokens(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.used_refresh.len();
        self.used_refresh.retain(|_, exp| *exp >= now);
        let reaped = before.saturating_sub(self.used_refresh.len());
        if reaped > 0 {
            debug!(count = reaped, "Reaped used refresh-token records");
        }
        reaped
    }
}

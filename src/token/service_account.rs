//! Service-account authentication for the `client_credentials` grant.
//!
//! Secrets are never stored: each account carries the SHA-256 digest of its
//! secret and presented secrets are hashed and compared in constant time.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::{AuthToken, TokenIssuer};
use crate::audit::{self, AuditEvent};
use crate::config::ServiceAccountConfig;
use crate::{Error, Result};

const HASH_PREFIX: &str = "sha256:";
/// Compared against when the client id is unknown; no secret hashes to it.
const UNKNOWN_CLIENT_DIGEST: [u8; 32] = [0; 32];

/// OAuth grant types a service account may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `client_credentials`
    ClientCredentials,
    /// `authorization_code`
    AuthorizationCode,
}

impl GrantType {
    /// Wire name of the grant type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientCredentials => "client_credentials",
            Self::AuthorizationCode => "authorization_code",
        }
    }
}

impl std::str::FromStr for GrantType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client_credentials" => Ok(Self::ClientCredentials),
            "authorization_code" => Ok(Self::AuthorizationCode),
            other => Err(Error::BadRequest(format!("unsupported grant_type '{other}'"))),
        }
    }
}

/// A registered service account
#[derive(Debug, Clone)]
pub struct ServiceAccount {
    /// Human-readable name
    pub name: String,
    /// Client id
    pub client_id: String,
    secret_hash: [u8; 32],
    /// Grant types this account may use
    pub grant_types: Vec<GrantType>,
}

impl ServiceAccount {
    /// Create an account from a `sha256:<hex>` (or bare hex) secret digest.
    pub fn new(
        name: &str,
        client_id: &str,
        secret_hash: &str,
        grant_types: Vec<GrantType>,
    ) -> Result<Self> {
        if client_id.is_empty() {
            return Err(Error::Config(format!(
                "Service account '{name}' has an empty client_id"
            )));
        }

        let digest = secret_hash.strip_prefix(HASH_PREFIX).unwrap_or(secret_hash);
        let bytes = hex::decode(digest).map_err(|e| {
            Error::Config(format!("Service account '{name}': invalid secret hash: {e}"))
        })?;
        let secret_hash: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::Config(format!(
                "Service account '{name}': secret hash must be a SHA-256 digest"
            ))
        })?;

        Ok(Self {
            name: name.to_string(),
            client_id: client_id.to_string(),
            secret_hash,
            grant_types,
        })
    }

    fn secret_matches(&self, secret: &str) -> bool {
        digest_matches(secret, &self.secret_hash)
    }

    fn allows(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }
}

/// Constant-time check of `secret`'s SHA-256 digest against `expected`.
fn digest_matches(secret: &str, expected: &[u8]) -> bool {
    let presented = Sha256::digest(secret.as_bytes());
    presented.as_slice().ct_eq(expected).into()
}

/// `sha256:<hex>` digest of a secret, as stored in configuration.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    format!("{HASH_PREFIX}{}", hex::encode(Sha256::digest(secret.as_bytes())))
}

/// Validates service-account credentials and issues PATs
pub struct ServiceAccountAuthenticator {
    accounts: DashMap<String, Arc<ServiceAccount>>,
    issuer: Arc<TokenIssuer>,
}

impl ServiceAccountAuthenticator {
    /// Create an authenticator with no accounts.
    #[must_use]
    pub fn new(issuer: Arc<TokenIssuer>) -> Self {
        Self {
            accounts: DashMap::new(),
            issuer,
        }
    }

    /// Create an authenticator with the configured accounts.
    pub fn from_config(issuer: Arc<TokenIssuer>, configs: &[ServiceAccountConfig]) -> Result<Self> {
        let authenticator = Self::new(issuer);
        for config in configs {
            authenticator.register(ServiceAccount::new(
                &config.name,
                &config.client_id,
                &config.client_secret_hash,
                config.grant_types.clone(),
            )?)?;
        }
        Ok(authenticator)
    }

    /// Register an account. A second account with the same client id is a `Conflict`.
    pub fn register(&self, account: ServiceAccount) -> Result<()> {
        match self.accounts.entry(account.client_id.clone()) {
            Entry::Occupied(_) => Err(Error::Conflict(format!(
                "service account client id '{}' is already registered",
                account.client_id
            ))),
            Entry::Vacant(slot) => {
                info!(name = %account.name, client_id = %account.client_id, "Registered service account");
                slot.insert(Arc::new(account));
                Ok(())
            }
        }
    }

    /// Whether `client_id` names a local account.
    #[must_use]
    pub fn is_known(&self, client_id: &str) -> bool {
        self.accounts.contains_key(client_id)
    }

    /// Check `client_id`/`secret` for `grant`.
    ///
    /// Unknown client or wrong secret → `Unauthorized`; valid credentials for
    /// a grant the account may not use → `Forbidden`.
    pub fn authenticate(
        &self,
        client_id: &str,
        secret: &str,
        grant: GrantType,
    ) -> Result<Arc<ServiceAccount>> {
        let account = self.accounts.get(client_id).map(|a| Arc::clone(a.value()));

        let Some(account) = account else {
            // Unknown ids pay the same hash and comparison as wrong secrets
            std::hint::black_box(digest_matches(secret, &UNKNOWN_CLIENT_DIGEST));
            return Err(Error::Unauthorized("invalid client credentials".to_string()));
        };

        if !account.secret_matches(secret) {
            warn!(client_id = %client_id, "Service account secret mismatch");
            return Err(Error::Unauthorized("invalid client credentials".to_string()));
        }

        if !account.allows(grant) {
            return Err(Error::Forbidden(format!(
                "grant type '{}' is not allowed for this client",
                grant.as_str()
            )));
        }

        Ok(account)
    }

    /// Validate the credential and mint a PAT.
    pub fn issue_pat(&self, client_id: &str, secret: &str) -> Result<AuthToken> {
        let account = match self.authenticate(client_id, secret, GrantType::ClientCredentials) {
            Ok(account) => account,
            Err(e) => {
                audit::emit(&AuditEvent::pat_denied(client_id, &e.to_string()));
                return Err(e);
            }
        };

        let token = self.issuer.issue_service_account_token(&account)?;
        audit::emit(&AuditEvent::pat_issued(&account.client_id, &account.name));
        Ok(token)
    }
}

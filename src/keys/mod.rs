//! Signing key management.
//!
//! # Lifecycle
//!
//! Exactly one key is *active* and signs new tokens. [`KeyStore::rotate`]
//! demotes it to *retired*: retired keys still verify tokens but never sign.
//! [`KeyStore::purge`] drops retired keys once every token they could have
//! signed has expired (`retired_at + retention < now`).
//!
//! Readers take an `Arc` snapshot of the whole key set, so a concurrent
//! rotation is never observed half-done. Writers are serialized.

pub mod signing_key;

use std::{path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Header, Validation, errors::ErrorKind, jwk::Jwk};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub use signing_key::SigningKey;

/// Key store and token verification errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Token `kid` names no known key (never existed, or purged).
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature does not verify, or the algorithm is not the pinned one.
    #[error("token signature is invalid")]
    SignatureInvalid,

    /// `exp` is in the past.
    #[error("token has expired")]
    TokenExpired,

    /// `iat` is further in the future than the allowed clock skew.
    #[error("token issued in the future")]
    NotYetValid,

    /// Not a decodable JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Claims are missing or inconsistent.
    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    /// Key could not be generated or loaded.
    #[error("key generation failed: {0}")]
    Generation(String),

    /// Token could not be signed.
    #[error("signing failed: {0}")]
    Signing(String),
}

impl KeyError {
    /// Short reason label for logs, audit and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownKey(_) => "unknown_key",
            Self::SignatureInvalid => "signature_invalid",
            Self::TokenExpired => "token_expired",
            Self::NotYetValid => "not_yet_valid",
            Self::Malformed(_) => "malformed",
            Self::InvalidClaims(_) => "invalid_claims",
            Self::Generation(_) => "generation_failed",
            Self::Signing(_) => "signing_failed",
        }
    }

    /// Whether this error is a rejected token rather than a server fault.
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        !matches!(self, Self::Generation(_) | Self::Signing(_))
    }

    fn from_jwt(err: &jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::SignatureInvalid,
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::InvalidClaims(format!("missing {claim}"))
            }
            _ => Self::Malformed(err.to_string()),
        }
    }
}

/// Claims carrying the registered time bounds the store enforces.
pub trait TimeBoundClaims {
    /// `iat`, seconds since the epoch.
    fn issued_at(&self) -> i64;
    /// `exp`, seconds since the epoch.
    fn expires_at(&self) -> i64;
}

/// Export format of [`KeyStore::public_keys`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyFormat {
    /// PEM `PUBLIC KEY` blocks
    Pem,
    /// JSON Web Keys
    #[default]
    Jwk,
}

impl std::str::FromStr for KeyFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pem" => Ok(Self::Pem),
            "jwk" => Ok(Self::Jwk),
            other => Err(format!("unsupported key format '{other}' (expected pem or jwk)")),
        }
    }
}

/// One exported public key.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PublicKey {
    /// PEM block
    Pem(String),
    /// JWK object
    Jwk(Jwk),
}

/// Every verifying key, active and retired.
#[derive(Debug, Clone, Serialize)]
pub struct PublicKeySet {
    /// Active key first, then retired keys newest first
    pub keys: Vec<PublicKey>,
}

#[derive(Debug, Clone)]
struct KeySet {
    active: Arc<SigningKey>,
    retired: Vec<Arc<SigningKey>>,
}

impl KeySet {
    fn find(&self, kid: &str) -> Option<&Arc<SigningKey>> {
        std::iter::once(&self.active)
            .chain(self.retired.iter())
            .find(|key| key.kid() == kid)
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<SigningKey>> {
        std::iter::once(&self.active).chain(self.retired.iter())
    }
}

/// Holds the active signing key and the retired keys still trusted for verification.
pub struct KeyStore {
    current: RwLock<Arc<KeySet>>,
    writer: Mutex<()>,
    retention: Duration,
    clock_skew: Duration,
}

impl KeyStore {
    /// Create a store whose first active key is `initial`.
    ///
    /// `retention` is the longest lifetime of any token this store signs;
    /// retired keys are kept that long. `clock_skew` bounds how far in the
    /// future a token's `iat` may be.
    #[must_use]
    pub fn new(initial: SigningKey, retention: Duration, clock_skew: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(KeySet {
                active: Arc::new(initial),
                retired: Vec::new(),
            })),
            writer: Mutex::new(()),
            retention,
            clock_skew,
        }
    }

    /// Create a store with a freshly generated key.
    pub fn generate(retention: Duration, clock_skew: Duration) -> Result<Self, KeyError> {
        Ok(Self::new(SigningKey::generate()?, retention, clock_skew))
    }

    /// Load the active key from `path`, generating and persisting one when
    /// the file does not exist. Without a path the key is ephemeral.
    pub async fn load_or_generate(
        path: Option<&Path>,
        retention: Duration,
        clock_skew: Duration,
    ) -> crate::Result<Self> {
        let Some(path) = path else {
            warn!("No signing key path configured, using an ephemeral key");
            return Ok(Self::generate(retention, clock_skew)?);
        };

        let key = if tokio::fs::try_exists(path).await? {
            let pem = tokio::fs::read_to_string(path).await?;
            SigningKey::from_pkcs8_pem(&pem)?
        } else {
            let pem = signing_key::generate_pkcs8_pem()?;
            write_private_key(path, &pem).await?;
            info!(path = %path.display(), "Generated new signing key");
            SigningKey::from_pkcs8_pem(&pem)?
        };

        info!(kid = %key.kid(), "Signing key loaded");
        Ok(Self::new(key, retention, clock_skew))
    }

    fn snapshot(&self) -> Arc<KeySet> {
        Arc::clone(&self.current.read())
    }

    /// The key currently used for signing.
    #[must_use]
    pub fn active_key(&self) -> Arc<SigningKey> {
        Arc::clone(&self.snapshot().active)
    }

    /// Key ids of all verifying keys, active first.
    #[must_use]
    pub fn kids(&self) -> Vec<String> {
        self.snapshot().iter().map(|k| k.kid().to_string()).collect()
    }

    /// Sign `claims` with the active key.
    pub fn sign<C>(&self, claims: &C) -> Result<String, KeyError>
    where
        C: Serialize + TimeBoundClaims,
    {
        if claims.expires_at() <= claims.issued_at() {
            return Err(KeyError::InvalidClaims(
                "exp must be after iat".to_string(),
            ));
        }

        let key = self.active_key();
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key.kid().to_string());

        jsonwebtoken::encode(&header, claims, key.encoding_key())
            .map_err(|e| KeyError::Signing(e.to_string()))
    }

    /// Verify `token` against the key named by its `kid`.
    ///
    /// Accepted iff the signature verifies, the algorithm is ES256, and
    /// `iat - clock_skew <= now <= exp`.
    pub fn verify<C>(&self, token: &str) -> Result<C, KeyError>
    where
        C: DeserializeOwned + TimeBoundClaims,
    {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| KeyError::Malformed(e.to_string()))?;
        if header.alg != Algorithm::ES256 {
            return Err(KeyError::SignatureInvalid);
        }
        let kid = header
            .kid
            .ok_or_else(|| KeyError::UnknownKey("<missing kid>".to_string()))?;

        let keys = self.snapshot();
        let key = keys
            .find(&kid)
            .ok_or_else(|| KeyError::UnknownKey(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iat", "sub"]);

        let data = jsonwebtoken::decode::<C>(token, key.decoding_key(), &validation)
            .map_err(|e| KeyError::from_jwt(&e))?;

        let now = Utc::now().timestamp();
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if data.claims.issued_at().saturating_sub(skew) > now {
            return Err(KeyError::NotYetValid);
        }
        if data.claims.expires_at() < now {
            return Err(KeyError::TokenExpired);
        }

        Ok(data.claims)
    }

    /// Every verifying key in the requested format.
    #[must_use]
    pub fn public_keys(&self, format: KeyFormat) -> PublicKeySet {
        let keys = self.snapshot();
        let keys = keys
            .iter()
            .map(|key| match format {
                KeyFormat::Pem => PublicKey::Pem(key.public_pem().to_string()),
                KeyFormat::Jwk => PublicKey::Jwk(key.jwk().clone()),
            })
            .collect();
        PublicKeySet { keys }
    }

    /// Generate a new key, make it active and retire the previous one.
    pub fn rotate(&self) -> Result<Arc<SigningKey>, KeyError> {
        Ok(self.rotate_to(SigningKey::generate()?))
    }

    /// Make `key` active and retire the previous active key.
    pub fn rotate_to(&self, key: SigningKey) -> Arc<SigningKey> {
        let _guard = self.writer.lock();
        let previous = self.snapshot();
        let now = Utc::now();

        let new_active = Arc::new(key);
        let mut retired = Vec::with_capacity(previous.retired.len() + 1);
        retired.push(Arc::new(previous.active.retire(now)));
        retired.extend(previous.retired.iter().cloned());

        *self.current.write() = Arc::new(KeySet {
            active: Arc::clone(&new_active),
            retired,
        });

        info!(
            kid = %new_active.kid(),
            retired_kid = %previous.active.kid(),
            "Signing key rotated"
        );
        new_active
    }

    /// Drop retired keys whose tokens have all expired. Returns the purged kids.
    pub fn purge(&self, now: DateTime<Utc>) -> Vec<String> {
        let _guard = self.writer.lock();
        let previous = self.snapshot();
        let retention =
            chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);

        let (expired, kept): (Vec<_>, Vec<_>) =
            previous.retired.iter().cloned().partition(|key| {
                key.retired_at()
                    .and_then(|at| at.checked_add_signed(retention))
                    .is_some_and(|deadline| deadline < now)
            });

        if expired.is_empty() {
            return Vec::new();
        }

        *self.current.write() = Arc::new(KeySet {
            active: Arc::clone(&previous.active),
            retired: kept,
        });

        let purged: Vec<String> = expired.iter().map(|k| k.kid().to_string()).collect();
        info!(kids = ?purged, "Purged retired signing keys");
        purged
    }
}

/// Generate a signing key and write it to `path` as PKCS#8 PEM (mode 0600).
///
/// Refuses to overwrite an existing file. Returns the new key's kid.
pub async fn generate_key_file(path: &Path) -> crate::Result<String> {
    if tokio::fs::try_exists(path).await? {
        return Err(crate::Error::Conflict(format!(
            "{} already exists",
            path.display()
        )));
    }

    let pem = signing_key::generate_pkcs8_pem()?;
    let kid = SigningKey::from_pkcs8_pem(&pem)?.kid().to_string();
    write_private_key(path, &pem).await?;
    Ok(kid)
}

async fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    let written = async {
        file.write_all(pem.as_bytes()).await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if written.is_err() {
        let _ = tokio::fs::remove_file(path).await;
    }
    written
}

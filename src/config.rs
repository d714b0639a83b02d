//! Configuration management

use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::token::service_account::GrantType;
use crate::upstream::provider::ProviderKind;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Signing key configuration
    pub keys: KeysConfig,
    /// Session token configuration
    pub tokens: TokensConfig,
    /// Account linking configuration
    pub link: LinkConfig,
    /// Upstream HTTP behaviour (timeouts, retry, circuit breaker)
    pub upstream: UpstreamConfig,
    /// Identity provider used for `authorization_code` exchange and
    /// delegated client credentials
    pub idp: Option<IdpConfig>,
    /// Linkable third-party providers
    pub providers: Vec<ProviderConfig>,
    /// Locally registered service accounts
    pub service_accounts: Vec<ServiceAccountConfig>,
    /// External token storage
    pub storage: StorageConfig,
    /// Developer mode
    pub dev: DevConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TOKEN_BROKER_ prefix); CLI flag variables are not config keys
        figment = figment.merge(
            Env::prefixed("TOKEN_BROKER_")
                .ignore(&["CONFIG", "PORT", "HOST", "LOG_LEVEL", "LOG_FORMAT", "DEV"])
                .split("__"),
        );

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secrets and endpoint URLs
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let providers = self
            .providers
            .iter_mut()
            .chain(self.idp.iter_mut().map(|idp| &mut idp.provider));
        for provider in providers {
            provider.client_id = Self::expand_string(&re, &provider.client_id);
            provider.client_secret = Self::expand_string(&re, &provider.client_secret);
            provider.resource = Self::expand_string(&re, &provider.resource);
            for url in [
                &mut provider.authorize_url,
                &mut provider.token_url,
                &mut provider.profile_url,
            ]
            .into_iter()
            .flatten()
            {
                *url = Self::expand_string(&re, url);
            }
        }

        for account in &mut self.service_accounts {
            account.client_secret_hash = Self::expand_string(&re, &account.client_secret_hash);
        }

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Reject configurations the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let lifetimes = [
            ("tokens.access_token_ttl", self.tokens.access_token_ttl),
            ("tokens.refresh_token_ttl", self.tokens.refresh_token_ttl),
            (
                "tokens.service_account_token_ttl",
                self.tokens.service_account_token_ttl,
            ),
            ("link.state_ttl", self.link.state_ttl),
            ("keys.maintenance_interval", self.keys.maintenance_interval),
        ];
        for (name, ttl) in lifetimes {
            if ttl.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.keys.rotation_interval.is_some_and(|period| period.is_zero()) {
            return Err(Error::Config(
                "keys.rotation_interval must be greater than zero".to_string(),
            ));
        }

        let mut resources = HashSet::new();
        for provider in &self.providers {
            let key = provider.resource.trim_end_matches('/');
            if !resources.insert(key.to_string()) {
                return Err(Error::Config(format!(
                    "Duplicate provider resource: {}",
                    provider.resource
                )));
            }
        }

        if self.storage.backend == StorageBackend::File && self.storage.directory().is_none() {
            return Err(Error::Config(
                "storage.directory is required for the file backend".to_string(),
            ));
        }

        Ok(())
    }

    /// Longest lifetime of any token the broker signs, used to decide when a
    /// retired signing key can no longer have outstanding tokens.
    #[must_use]
    pub fn max_token_lifetime(&self) -> Duration {
        self.tokens
            .access_token_ttl
            .max(self.tokens.refresh_token_ttl)
            .max(self.tokens.service_account_token_ttl)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally reachable base URL, used for the OAuth callback and
    /// `WWW-Authenticate: LINK` hints
    pub public_url: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8089,
            public_url: "http://localhost:8089".to_string(),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Absolute URL of the link callback endpoint.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}/token/link/callback", self.public_url.trim_end_matches('/'))
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// PKCS#8 PEM file holding the signing key. Generated on first start
    /// when missing; without a path an ephemeral key is used.
    pub private_key_path: Option<PathBuf>,
    /// Rotate the active key on this cadence (disabled when unset)
    #[serde(with = "humantime_serde::option")]
    pub rotation_interval: Option<Duration>,
    /// How often retired keys, expired link states and used refresh-token
    /// records are purged
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            private_key_path: None,
            rotation_interval: None,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Whether a refresh token may be presented more than once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Usable until it expires
    #[default]
    Reusable,
    /// Rejected after the first successful refresh
    SingleUse,
}

/// Session token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// `iss` claim of every minted token
    pub issuer: String,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// Service-account PAT lifetime
    #[serde(with = "humantime_serde")]
    pub service_account_token_ttl: Duration,
    /// Tolerance for tokens whose `iat` is slightly in the future
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Refresh token reuse policy
    pub refresh_policy: RefreshPolicy,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8089".to_string(),
            access_token_ttl: Duration::from_secs(30 * 24 * 3600),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 3600),
            service_account_token_ttl: Duration::from_secs(24 * 3600),
            clock_skew: Duration::from_secs(30),
            refresh_policy: RefreshPolicy::Reusable,
        }
    }
}

/// Account linking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link state lifetime
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// Redirect after success when the request carried neither `redirect`
    /// nor a `Referer`
    pub success_redirect: String,
    /// Redirect for failed callbacks; `verified=false&error=...` is appended
    pub failure_redirect: String,
    /// Hosts allowed as redirect targets (empty allows any)
    pub allowed_redirect_hosts: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(300),
            success_redirect: "http://localhost:8089/".to_string(),
            failure_redirect: "http://localhost:8089/".to_string(),
            allowed_redirect_hosts: Vec::new(),
        }
    }
}

/// Upstream HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Timeout of a single HTTP attempt
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Overall deadline for one upstream operation including retries
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            deadline: Duration::from_secs(25),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failure threshold before opening
    pub failure_threshold: u32,
    /// Success threshold to close
    pub success_threshold: u32,
    /// Time to wait before half-open
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// An OAuth provider a user can link, or the identity provider itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider family; supplies endpoint and scope defaults
    pub kind: ProviderKind,
    /// Canonical resource URL (e.g. `https://github.com`, or a Keycloak realm URL)
    pub resource: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret (supports `${VAR}`)
    #[serde(default)]
    pub client_secret: String,
    /// Requested scope (kind default when unset)
    #[serde(default)]
    pub scope: Option<String>,
    /// Authorization endpoint override
    #[serde(default)]
    pub authorize_url: Option<String>,
    /// Token endpoint override
    #[serde(default)]
    pub token_url: Option<String>,
    /// Profile endpoint override, used to learn the external username
    #[serde(default)]
    pub profile_url: Option<String>,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpConfig {
    /// Provider endpoints and client credentials
    #[serde(flatten)]
    pub provider: ProviderConfig,
    /// Forward `client_credentials` requests for unknown clients to the IdP
    #[serde(default)]
    pub delegate_client_credentials: bool,
}

/// A locally registered service account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountConfig {
    /// Human-readable account name
    pub name: String,
    /// Client id presented on `POST /token`
    pub client_id: String,
    /// `sha256:<hex>` digest of the client secret (see `token-broker hash-secret`)
    pub client_secret_hash: String,
    /// Grant types this account may use
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::ClientCredentials]
}

/// External token storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory, lost on restart
    #[default]
    Memory,
    /// One JSON file per linked token
    File,
}

/// External token storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,
    /// Directory for the file backend (defaults to `~/.token-broker/tokens`)
    pub directory: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved storage directory for the file backend.
    #[must_use]
    pub fn directory(&self) -> Option<PathBuf> {
        self.directory
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".token-broker").join("tokens")))
    }
}

/// Developer mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Enables `GET /token/generate`
    pub enabled: bool,
    /// Identities `GET /token/generate` mints tokens for
    pub identities: Vec<String>,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            identities: vec!["developer".to_string()],
        }
    }
}

/// Serde support for human-readable durations (`"30s"`, `"5m"`, `"1h"`, `"100ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn format_duration(duration: Duration) -> String {
        if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>` fields
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "TOKEN_BROKER_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("TOKEN_BROKER_TEST_KEY_A").unwrap(),
            "hello_from_env_file"
        );
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_full_config_deserialized_from_yaml() {
        let yaml = r#"
server:
  host: "0.0.0.0"
  port: 9000
  public_url: "https://auth.example.com"
keys:
  rotation_interval: "24h"
tokens:
  access_token_ttl: "1h"
  refresh_policy: single_use
link:
  state_ttl: "5m"
  allowed_redirect_hosts: ["app.example.com"]
providers:
  - kind: github
    resource: "https://github.com"
    client_id: "gh-client"
    client_secret: "${TOKEN_BROKER_TEST_GH_SECRET:-fallback}"
service_accounts:
  - name: ci
    client_id: "ci-bot"
    client_secret_hash: "sha256:00"
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.expand_env_vars().unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.server.callback_url(),
            "https://auth.example.com/token/link/callback"
        );
        assert_eq!(config.keys.rotation_interval, Some(Duration::from_secs(86_400)));
        assert_eq!(config.tokens.access_token_ttl, Duration::from_secs(3600));
        assert_eq!(config.tokens.refresh_policy, RefreshPolicy::SingleUse);
        assert_eq!(config.providers[0].kind, ProviderKind::GitHub);
        assert_eq!(config.providers[0].client_secret, "fallback");
        assert_eq!(
            config.service_accounts[0].grant_types,
            vec![GrantType::ClientCredentials]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_provider_resources() {
        let provider = ProviderConfig {
            kind: ProviderKind::GitHub,
            resource: "https://github.com".to_string(),
            client_id: "a".to_string(),
            client_secret: String::new(),
            scope: None,
            authorize_url: None,
            token_url: None,
            profile_url: None,
        };
        let mut duplicate = provider.clone();
        duplicate.resource = "https://github.com/".to_string();
        let config = Config {
            providers: vec![provider, duplicate],
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_lifetime() {
        let mut config = Config::default();
        config.tokens.access_token_ttl = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_key_intervals() {
        // GIVEN: a zero maintenance period
        let mut config = Config::default();
        config.keys.maintenance_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(m)) if m.contains("maintenance_interval")));

        // GIVEN: a zero rotation period
        let mut config = Config::default();
        config.keys.rotation_interval = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(m)) if m.contains("rotation_interval")));

        // THEN: rotation may still be left off
        let mut config = Config::default();
        config.keys.rotation_interval = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_units() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }
}

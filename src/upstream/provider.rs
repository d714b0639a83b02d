//! Upstream provider capabilities
//!
//! Each [`ProviderKind`] supplies default endpoints, scope and the profile
//! field carrying the external username. Any endpoint can be overridden in
//! configuration; `generic` providers must configure theirs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ProviderConfig;
use crate::{Error, Result};

/// Provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Keycloak realm (resource is the realm URL)
    Keycloak,
    /// github.com or GitHub Enterprise
    GitHub,
    /// OpenShift cluster (resource is the API server URL)
    OpenShift,
    /// Any OAuth2 provider with explicitly configured endpoints
    Generic,
}

impl ProviderKind {
    fn default_scope(self) -> &'static str {
        match self {
            Self::Keycloak => "openid",
            Self::GitHub => "admin:repo_hook read:org repo user gist",
            Self::OpenShift => "user:full",
            Self::Generic => "",
        }
    }

    /// Default (authorize, token, profile) endpoints relative to the resource.
    fn default_endpoints(self, resource: &Url) -> Option<(String, String, Option<String>)> {
        let base = resource.as_str().trim_end_matches('/');
        match self {
            Self::GitHub if resource.host_str() == Some("github.com") => Some((
                "https://github.com/login/oauth/authorize".to_string(),
                "https://github.com/login/oauth/access_token".to_string(),
                Some("https://api.github.com/user".to_string()),
            )),
            // GitHub Enterprise
            Self::GitHub => Some((
                format!("{base}/login/oauth/authorize"),
                format!("{base}/login/oauth/access_token"),
                Some(format!("{base}/api/v3/user")),
            )),
            Self::OpenShift => Some((
                format!("{base}/oauth/authorize"),
                format!("{base}/oauth/token"),
                Some(format!("{base}/apis/user.openshift.io/v1/users/~")),
            )),
            Self::Keycloak => Some((
                format!("{base}/protocol/openid-connect/auth"),
                format!("{base}/protocol/openid-connect/token"),
                Some(format!("{base}/protocol/openid-connect/userinfo")),
            )),
            Self::Generic => None,
        }
    }

    /// Extract the external username from a profile document.
    fn username_from_profile(self, profile: &serde_json::Value) -> Option<String> {
        let field = match self {
            Self::GitHub => profile.get("login"),
            Self::OpenShift => profile.pointer("/metadata/name"),
            Self::Keycloak => profile.get("preferred_username"),
            Self::Generic => ["preferred_username", "login", "username", "name"]
                .iter()
                .find_map(|key| profile.get(*key)),
        };
        field
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// A resolved upstream provider
#[derive(Clone)]
pub struct Provider {
    /// Provider family
    pub kind: ProviderKind,
    /// Canonical resource URL external tokens are stored under
    pub resource: Url,
    /// Authorization endpoint
    pub authorize_url: Url,
    /// Token endpoint
    pub token_url: Url,
    /// Profile endpoint
    pub profile_url: Option<Url>,
    /// OAuth client id
    pub client_id: String,
    client_secret: String,
    /// Requested scope
    pub scope: String,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("kind", &self.kind)
            .field("resource", &self.resource.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Resolve a provider from configuration, filling in kind defaults.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let resource = parse_url("resource", &config.resource)?;
        let defaults = config.kind.default_endpoints(&resource);

        let (authorize, token, profile) = match (&config.authorize_url, &config.token_url, defaults)
        {
            (Some(a), Some(t), defaults) => (
                a.clone(),
                t.clone(),
                config
                    .profile_url
                    .clone()
                    .or_else(|| defaults.and_then(|d| d.2)),
            ),
            (a, t, Some((da, dt, dp))) => (
                a.clone().unwrap_or(da),
                t.clone().unwrap_or(dt),
                config.profile_url.clone().or(dp),
            ),
            (_, _, None) => {
                return Err(Error::Config(format!(
                    "Provider {} needs authorize_url and token_url",
                    config.resource
                )));
            }
        };

        Ok(Self {
            kind: config.kind,
            resource,
            authorize_url: parse_url("authorize_url", &authorize)?,
            token_url: parse_url("token_url", &token)?,
            profile_url: profile.map(|p| parse_url("profile_url", &p)).transpose()?,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config
                .scope
                .clone()
                .unwrap_or_else(|| config.kind.default_scope().to_string()),
        })
    }

    /// OAuth client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Canonical resource identifier (no trailing slash).
    #[must_use]
    pub fn resource_id(&self) -> &str {
        self.resource.as_str().trim_end_matches('/')
    }

    /// Length of the matched path prefix when `resource` belongs to this provider.
    fn match_len(&self, resource: &Url) -> Option<usize> {
        let same_origin = self.resource.scheme() == resource.scheme()
            && self.resource.host_str() == resource.host_str()
            && self.resource.port_or_known_default() == resource.port_or_known_default();
        if !same_origin {
            return None;
        }

        let prefix = self.resource.path().trim_end_matches('/');
        let path = resource.path();
        let within = path == prefix
            || path.trim_end_matches('/') == prefix
            || path.starts_with(&format!("{prefix}/"));
        within.then_some(prefix.len())
    }

    /// Username carried by a profile document.
    #[must_use]
    pub fn username_from_profile(&self, profile: &serde_json::Value) -> Option<String> {
        self.kind.username_from_profile(profile)
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("Invalid {field} '{value}': {e}")))
}

/// All linkable providers, selected by resource URL
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<Provider>>,
}

impl ProviderRegistry {
    /// Build a registry from resolved providers.
    #[must_use]
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
        }
    }

    /// Build a registry from configuration.
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self> {
        let providers = configs
            .iter()
            .map(Provider::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(providers))
    }

    /// Provider responsible for `resource`; the longest matching path wins.
    pub fn for_resource(&self, resource: &str) -> Result<Arc<Provider>> {
        let url = Url::parse(resource.trim())
            .map_err(|e| Error::BadRequest(format!("Invalid resource URL '{resource}': {e}")))?;

        self.providers
            .iter()
            .filter_map(|p| p.match_len(&url).map(|len| (len, p)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, p)| Arc::clone(p))
            .ok_or_else(|| {
                Error::BadRequest(format!("No provider configured for resource '{resource}'"))
            })
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

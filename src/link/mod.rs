//! Account linking
//!
//! A link runs through two HTTP round-trips with the upstream provider:
//!
//! ```text
//! Idle ──start──▶ StatePending ──callback──▶ CallbackReceived
//!                                                │ consume state
//!                                                ▼
//!                         Linked ◀──upsert── Exchanged
//! ```
//!
//! Any step can exit to `Failed(reason)`. A failed state consumption never
//! reaches the provider. Callback failures are reported as a redirect to the
//! configured failure URL with `verified=false&error=<message>`, since the
//! caller is a browser in the middle of a redirect.
//!
//! When several resources are requested at once, the first is linked and
//! the rest travel in the state record; each successful callback starts the
//! next link until none remain.

pub mod state;

pub use state::{InMemoryStateBackend, LinkState, StateBackend, StateStore};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::audit::{self, AuditEvent};
use crate::config::LinkConfig;
use crate::external_token::{ExternalToken, ExternalTokenStore};
use crate::upstream::{Provider, ProviderRegistry, UpstreamClient};
use crate::{Error, Result};

/// Where a link flow stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No flow in progress
    Idle,
    /// State issued, user agent sent to the provider
    StatePending,
    /// Provider redirected back with `code` and `state`
    CallbackReceived,
    /// Code exchanged for a provider token
    Exchanged,
    /// Token stored
    Linked,
    /// Terminal failure
    Failed(LinkFailure),
}

/// Why a link flow failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    /// State unknown or already consumed
    InvalidState,
    /// State past its TTL
    StateExpired,
    /// Provider rejected or failed the code exchange
    CodeExchangeFailed,
    /// Token could not be stored
    StoreFailed,
}

impl LinkFailure {
    /// Metric and audit label.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidState => "invalid_state",
            Self::StateExpired => "state_expired",
            Self::CodeExchangeFailed => "code_exchange_failed",
            Self::StoreFailed => "store_failed",
        }
    }
}

/// Result of a callback: the final phase and where to send the user agent
#[derive(Debug, Clone)]
pub struct LinkOutcome {
    /// `Linked`, `StatePending` (next resource in a chain) or `Failed`
    pub phase: LinkPhase,
    /// Redirect target
    pub redirect: Url,
}

/// Orchestrates account linking and external token access
pub struct LinkService {
    states: StateStore,
    providers: Arc<ProviderRegistry>,
    upstream: Arc<UpstreamClient>,
    tokens: Arc<dyn ExternalTokenStore>,
    callback_url: String,
    success_redirect: Url,
    failure_redirect: Url,
    allowed_redirect_hosts: Vec<String>,
    deadline: Duration,
}

impl LinkService {
    /// Create a link service.
    ///
    /// `deadline` bounds the upstream work of a single request.
    pub fn new(
        states: StateStore,
        providers: Arc<ProviderRegistry>,
        upstream: Arc<UpstreamClient>,
        tokens: Arc<dyn ExternalTokenStore>,
        config: &LinkConfig,
        callback_url: String,
        deadline: Duration,
    ) -> Result<Self> {
        let parse = |field: &str, value: &str| {
            Url::parse(value)
                .map_err(|e| Error::Config(format!("Invalid link.{field} '{value}': {e}")))
        };

        Ok(Self {
            states,
            providers,
            upstream,
            tokens,
            callback_url,
            success_redirect: parse("success_redirect", &config.success_redirect)?,
            failure_redirect: parse("failure_redirect", &config.failure_redirect)?,
            allowed_redirect_hosts: config
                .allowed_redirect_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            deadline,
        })
    }

    /// Providers known to this service.
    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Drop expired link states.
    pub async fn reap_expired_states(&self) -> usize {
        self.states.reap_expired().await
    }

    /// Start linking the comma-separated resources in `for_param`.
    ///
    /// Every resource is validated before any state is issued. Returns the
    /// authorize URL of the first resource's provider.
    pub async fn start(
        &self,
        identity_id: &str,
        for_param: &str,
        redirect: Option<&str>,
        referer: Option<&str>,
    ) -> Result<Url> {
        let providers = for_param
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| self.providers.for_resource(r))
            .collect::<Result<Vec<_>>>()?;

        let Some((first, rest)) = providers.split_first() else {
            return Err(Error::BadRequest(
                "query parameter 'for' is required".to_string(),
            ));
        };

        let redirect_url = self.resolve_redirect(redirect, referer)?;
        let pending = rest.iter().map(|p| p.resource_id().to_string()).collect();

        let state = self
            .states
            .issue(identity_id, first.resource_id(), pending, redirect_url.as_str())
            .await?;

        audit::emit(&AuditEvent::link_started(identity_id, first.resource_id()));
        Ok(self
            .upstream
            .build_authorize_url(first, &state, &self.callback_url))
    }

    /// `redirect` param, else `Referer`, else the configured success redirect.
    fn resolve_redirect(&self, redirect: Option<&str>, referer: Option<&str>) -> Result<Url> {
        let candidate = redirect
            .filter(|r| !r.trim().is_empty())
            .or(referer.filter(|r| !r.trim().is_empty()));

        let Some(candidate) = candidate else {
            return Ok(self.success_redirect.clone());
        };

        let url = Url::parse(candidate.trim())
            .map_err(|e| Error::BadRequest(format!("Invalid redirect URL '{candidate}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::BadRequest(format!(
                "Redirect URL must be http(s): '{candidate}'"
            )));
        }

        if !self.allowed_redirect_hosts.is_empty() {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            if !self.allowed_redirect_hosts.contains(&host) {
                return Err(Error::BadRequest(format!(
                    "Redirect host '{host}' is not allowed"
                )));
            }
        }
        Ok(url)
    }

    /// Handle the provider redirect carrying `code` and `state`.
    ///
    /// Never fails: errors become a failure redirect in the outcome.
    pub async fn callback(&self, code: &str, state: &str) -> LinkOutcome {
        let deadline = Instant::now() + self.deadline;
        debug!(phase = ?LinkPhase::CallbackReceived, "Link callback");

        let link = match self.states.consume_once(state).await {
            Ok(link) => link,
            Err(e) => {
                let reason = match e {
                    Error::StateExpired => LinkFailure::StateExpired,
                    _ => LinkFailure::InvalidState,
                };
                return self.fail(reason, None, &e);
            }
        };

        let provider = match self.providers.for_resource(&link.resource) {
            Ok(provider) => provider,
            Err(e) => return self.fail(LinkFailure::CodeExchangeFailed, Some(&link), &e),
        };

        let token = match self
            .upstream
            .exchange_code(&provider, code, &self.callback_url, deadline)
            .await
        {
            Ok(token) => token,
            Err(e) => return self.fail(LinkFailure::CodeExchangeFailed, Some(&link), &e),
        };
        debug!(phase = ?LinkPhase::Exchanged, resource = %link.resource, "Code exchanged");

        let mut external =
            ExternalToken::from_oauth(&link.identity_id, provider.resource_id(), token, &provider.scope);
        external.username = self
            .best_effort_username(&provider, &external.access_token, deadline)
            .await;

        if let Err(e) = self.tokens.upsert(external).await {
            return self.fail(LinkFailure::StoreFailed, Some(&link), &e);
        }

        record_callback("linked");
        audit::emit(&AuditEvent::link_completed(&link.identity_id, &link.resource));
        info!(identity = %link.identity_id, resource = %link.resource, "Account linked");

        self.next_in_chain(link).await
    }

    /// Continue with the next pending resource, or finish at the redirect URL.
    async fn next_in_chain(&self, link: LinkState) -> LinkOutcome {
        let finished = |link: &LinkState| LinkOutcome {
            phase: LinkPhase::Linked,
            redirect: Url::parse(&link.redirect_url)
                .unwrap_or_else(|_| self.success_redirect.clone()),
        };

        let Some((next, rest)) = link.pending.split_first() else {
            return finished(&link);
        };

        let provider = match self.providers.for_resource(next) {
            Ok(provider) => provider,
            Err(e) => {
                // Provider config changed between start and callback
                warn!(resource = %next, error = %e, "Skipping chained link");
                return finished(&link);
            }
        };

        match self
            .states
            .issue(&link.identity_id, next, rest.to_vec(), &link.redirect_url)
            .await
        {
            Ok(state) => {
                audit::emit(&AuditEvent::link_started(&link.identity_id, next));
                LinkOutcome {
                    phase: LinkPhase::StatePending,
                    redirect: self
                        .upstream
                        .build_authorize_url(&provider, &state, &self.callback_url),
                }
            }
            Err(e) => self.fail(LinkFailure::StoreFailed, Some(&link), &e),
        }
    }

    fn fail(&self, reason: LinkFailure, link: Option<&LinkState>, error: &Error) -> LinkOutcome {
        record_callback(reason.code());
        audit::emit(&AuditEvent::link_failed(
            link.map(|l| l.identity_id.as_str()),
            link.map(|l| l.resource.as_str()),
            reason.code(),
        ));
        warn!(reason = reason.code(), error = %error, "Link failed");

        let mut redirect = self.failure_redirect.clone();
        redirect
            .query_pairs_mut()
            .append_pair("verified", "false")
            .append_pair("error", &public_message(error));

        LinkOutcome {
            phase: LinkPhase::Failed(reason),
            redirect,
        }
    }

    async fn best_effort_username(
        &self,
        provider: &Provider,
        access_token: &str,
        deadline: Instant,
    ) -> Option<String> {
        match self
            .upstream
            .fetch_username(provider, access_token, deadline)
            .await
        {
            Ok(username) => username,
            Err(e) => {
                debug!(resource = %provider.resource_id(), error = %e, "Username lookup failed");
                None
            }
        }
    }

    /// Stored token for `(identity_id, resource)`, refreshed if expired.
    ///
    /// Fails with `NotFound` when nothing is linked, or when the provider
    /// rejected the refresh (the stale token is deleted so the user relinks).
    pub async fn retrieve(
        &self,
        identity_id: &str,
        resource: &str,
        force_pull: bool,
    ) -> Result<ExternalToken> {
        let provider = self.providers.for_resource(resource)?;
        let canonical = provider.resource_id();
        let deadline = Instant::now() + self.deadline;

        let mut token = self
            .tokens
            .get(identity_id, canonical)
            .await?
            .ok_or_else(|| not_linked(canonical))?;
        let mut dirty = false;

        if token.is_expired(Utc::now()) {
            let Some(refresh_token) = token.refresh_token.clone() else {
                self.drop_stale(identity_id, canonical, "expired").await?;
                return Err(not_linked(canonical));
            };

            match self.upstream.refresh(&provider, &refresh_token, deadline).await {
                Ok(fresh) => {
                    token = token.refreshed(fresh);
                    dirty = true;
                }
                Err(Error::InvalidGrant(detail)) => {
                    debug!(resource = %canonical, detail = %detail, "Refresh rejected");
                    self.drop_stale(identity_id, canonical, "refresh_rejected").await?;
                    return Err(not_linked(canonical));
                }
                Err(e) => return Err(e),
            }
        }

        if force_pull || token.username.is_none() {
            let username = self
                .best_effort_username(&provider, &token.access_token, deadline)
                .await;
            if username.is_some() && username != token.username {
                token.username = username;
                dirty = true;
            }
        }

        if dirty {
            self.tokens.upsert(token.clone()).await?;
        }
        Ok(token)
    }

    /// Remove the stored token. Removing a token that does not exist is a no-op.
    pub async fn unlink(&self, identity_id: &str, resource: &str) -> Result<bool> {
        let provider = self.providers.for_resource(resource)?;
        let removed = self.tokens.delete(identity_id, provider.resource_id()).await?;
        if removed {
            audit::emit(&AuditEvent::external_deleted(
                identity_id,
                provider.resource_id(),
                "unlinked",
            ));
        }
        Ok(removed)
    }

    async fn drop_stale(&self, identity_id: &str, resource: &str, reason: &str) -> Result<()> {
        if self.tokens.delete(identity_id, resource).await? {
            audit::emit(&AuditEvent::external_deleted(identity_id, resource, reason));
        }
        Ok(())
    }
}

fn not_linked(resource: &str) -> Error {
    Error::NotFound(format!("no token linked for '{resource}'"))
}

/// Message placed in the failure redirect. Internal causes stay in the logs.
fn public_message(error: &Error) -> String {
    match error {
        Error::InvalidState
        | Error::StateExpired
        | Error::InvalidGrant(_)
        | Error::UpstreamTimeout(_)
        | Error::UpstreamUnavailable(_)
        | Error::BadRequest(_) => error.to_string(),
        _ => "internal error".to_string(),
    }
}

fn record_callback(outcome: &'static str) {
    telemetry_metrics::counter!("link_callbacks_total", "outcome" => outcome).increment(1);
}

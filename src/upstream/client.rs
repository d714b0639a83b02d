//! HTTP client for upstream OAuth providers
//!
//! Every operation takes a caller deadline. Individual attempts are bounded
//! by the per-request timeout and retried on transient failures (transport,
//! timeout, 5xx, 429). When the deadline elapses the operation stops with
//! [`Error::UpstreamTimeout`] and is not retried. A 4xx or an OAuth error
//! body becomes [`Error::InvalidGrant`].

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::{Client, Response, StatusCode, header};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::provider::Provider;
use super::token::{OAuthToken, TokenEndpointReply};
use crate::config::{CircuitBreakerConfig, UpstreamConfig};
use crate::failsafe::{CircuitBreaker, RetryPolicy, with_retry};
use crate::{Error, Result};

/// OAuth client shared by all providers
pub struct UpstreamClient {
    http: Client,
    retry: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl UpstreamClient {
    /// Create a client from configuration
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("token-broker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            retry: RetryPolicy::new(&config.retry),
            breaker_config: config.circuit_breaker.clone(),
            breakers: DashMap::new(),
        })
    }

    /// Authorization URL the user agent is sent to. Pure; no I/O.
    #[must_use]
    pub fn build_authorize_url(&self, provider: &Provider, state: &str, redirect_uri: &str) -> Url {
        let mut url = provider.authorize_url.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &provider.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("state", state);
            if !provider.scope.is_empty() {
                params.append_pair("scope", &provider.scope);
            }
        }
        url
    }

    /// Exchange an authorization code for a token.
    pub async fn exchange_code(
        &self,
        provider: &Provider,
        code: &str,
        redirect_uri: &str,
        deadline: Instant,
    ) -> Result<OAuthToken> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret()),
        ];
        self.token_request(provider, "exchange_code", &params, deadline)
            .await
    }

    /// Obtain a new access token with a refresh token.
    pub async fn refresh(
        &self,
        provider: &Provider,
        refresh_token: &str,
        deadline: Instant,
    ) -> Result<OAuthToken> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret()),
        ];
        let mut token = self
            .token_request(provider, "refresh", &params, deadline)
            .await?;

        // Providers may omit the refresh token when it is unchanged
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    /// Client-credentials grant on behalf of `client_id`.
    pub async fn client_credentials(
        &self,
        provider: &Provider,
        client_id: &str,
        client_secret: &str,
        deadline: Instant,
    ) -> Result<OAuthToken> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        self.token_request(provider, "client_credentials", &params, deadline)
            .await
    }

    /// Look up the external username with `access_token`.
    ///
    /// Returns `Ok(None)` when the provider has no profile endpoint or the
    /// profile carries no recognizable username.
    pub async fn fetch_username(
        &self,
        provider: &Provider,
        access_token: &str,
        deadline: Instant,
    ) -> Result<Option<String>> {
        let Some(profile_url) = provider.profile_url.as_ref() else {
            return Ok(None);
        };

        let profile: serde_json::Value = self
            .guarded(provider, "fetch_username", deadline, move || async move {
                let response = self
                    .http
                    .get(profile_url.clone())
                    .bearer_auth(access_token)
                    .header(header::ACCEPT, "application/json")
                    .send()
                    .await
                    .map_err(transport_error)?;
                let response = check_status(response).await?;
                response.json().await.map_err(transport_error)
            })
            .await?;

        Ok(provider.username_from_profile(&profile))
    }

    async fn token_request(
        &self,
        provider: &Provider,
        operation: &'static str,
        params: &[(&str, &str)],
        deadline: Instant,
    ) -> Result<OAuthToken> {
        self.guarded(provider, operation, deadline, move || async move {
            let response = self
                .http
                .post(provider.token_url.clone())
                .header(header::ACCEPT, "application/json")
                .form(params)
                .send()
                .await
                .map_err(transport_error)?;

            let response = check_status(response).await?;
            let body = response.text().await.map_err(transport_error)?;
            match serde_json::from_str::<TokenEndpointReply>(&body) {
                Ok(TokenEndpointReply::Token(token)) => Ok(token.into_token(Utc::now())),
                Ok(TokenEndpointReply::Error(err)) => Err(Error::InvalidGrant(err.describe())),
                Err(e) => Err(Error::UpstreamUnavailable(format!(
                    "Unparseable token response: {e}"
                ))),
            }
        })
        .await
    }

    /// Run `attempt` under the provider's circuit breaker, the retry policy
    /// and the caller deadline.
    async fn guarded<T, F, Fut>(
        &self,
        provider: &Provider,
        operation: &'static str,
        deadline: Instant,
        attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(provider);
        if !breaker.can_proceed() {
            record(operation, "circuit_open");
            return Err(Error::UpstreamUnavailable(format!(
                "{} is failing, circuit open",
                provider.resource_id()
            )));
        }

        let outcome =
            tokio::time::timeout_at(deadline, with_retry(&self.retry, operation, attempt)).await;

        match outcome {
            Ok(Ok(value)) => {
                breaker.record_success();
                record(operation, "ok");
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_retryable() {
                    breaker.record_failure();
                } else {
                    // The provider answered; it is healthy even if it said no
                    breaker.record_success();
                }
                record(operation, "error");
                debug!(provider = %provider.resource_id(), operation, error = %e, "Upstream call failed");
                Err(e)
            }
            Err(_elapsed) => {
                breaker.record_failure();
                record(operation, "deadline");
                warn!(provider = %provider.resource_id(), operation, "Upstream deadline exceeded");
                Err(Error::UpstreamTimeout(format!(
                    "{operation} against {} exceeded the deadline",
                    provider.resource_id()
                )))
            }
        }
    }

    fn breaker(&self, provider: &Provider) -> Arc<CircuitBreaker> {
        let key = provider.resource_id().to_string();
        Arc::clone(
            self.breakers
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(
                        provider.resource_id(),
                        &self.breaker_config,
                    ))
                })
                .value(),
        )
    }
}

fn record(operation: &'static str, outcome: &'static str) {
    telemetry_metrics::counter!(
        "upstream_requests_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::UpstreamUnavailable(e.to_string())
}

/// Map non-success statuses: 5xx and 429 are transient, other 4xx are rejections.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::UpstreamUnavailable(format!("HTTP {status}")));
    }

    let detail = serde_json::from_str::<super::token::TokenErrorResponse>(&body)
        .map_or_else(|_| format!("HTTP {status}"), |err| err.describe());
    Err(Error::InvalidGrant(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::upstream::provider::ProviderKind;

    #[test]
    fn authorize_url_carries_client_state_and_redirect() {
        let client = UpstreamClient::new(&UpstreamConfig::default()).unwrap();
        let provider = Provider::from_config(&ProviderConfig {
            kind: ProviderKind::GitHub,
            resource: "https://github.com".to_string(),
            client_id: "gh-client".to_string(),
            client_secret: "s3cret".to_string(),
            scope: Some("repo".to_string()),
            authorize_url: None,
            token_url: None,
            profile_url: None,
        })
        .unwrap();

        let url = client.build_authorize_url(
            &provider,
            "state-123",
            "https://broker.example.com/token/link/callback",
        );
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("github.com"));
        assert_eq!(pairs["state"], "state-123");
        assert_eq!(pairs["client_id"], "gh-client");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], "repo");
        assert_eq!(
            pairs["redirect_uri"],
            "https://broker.example.com/token/link/callback"
        );
        assert!(!url.as_str().contains("s3cret"));
    }
}

//! HTTP handlers
//!
//! Handlers only extract and validate parameters, call the core services
//! and shape the response. Parameter validation fails with `BadRequest`
//! before any network or store call.

use std::sync::Arc;

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use super::auth::Caller;
use super::router::{AppState, IdentityProvider};
use crate::audit::{self, AuditEvent};
use crate::keys::KeyFormat;
use crate::token::{AuthToken, GrantType};
use crate::upstream::OAuthToken;
use crate::{Error, Result};

/// Query of `GET /token` and `DELETE /token`
#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    /// Resource URL
    #[serde(rename = "for")]
    pub resource: Option<String>,
    /// Re-fetch the username from the provider
    #[serde(default)]
    pub force_pull: Option<bool>,
}

impl ResourceQuery {
    fn required_resource(&self) -> Result<&str> {
        self.resource
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::BadRequest("query parameter 'for' is required".to_string()))
    }
}

/// GET /token
pub async fn get_external_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ResourceQuery>,
) -> Response {
    let resource = match query.required_resource() {
        Ok(resource) => resource,
        Err(e) => return e.into_response(),
    };

    match state
        .links
        .retrieve(&caller.identity_id, resource, query.force_pull.unwrap_or(false))
        .await
    {
        Ok(token) => Json(token.document()).into_response(),
        Err(Error::NotFound(detail)) => link_required(&state.public_url, resource, detail),
        Err(e) => e.into_response(),
    }
}

/// 401 telling the client where to link the resource.
fn link_required(public_url: &str, resource: &str, detail: String) -> Response {
    let encoded: String = url::form_urlencoded::byte_serialize(resource.as_bytes()).collect();
    let challenge = format!(
        "LINK url=\"{}/token/link?for={encoded}\", description=\"{resource} token is missing or invalid\"",
        public_url.trim_end_matches('/')
    );

    let mut response = Error::Unauthorized(detail).into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// DELETE /token
pub async fn delete_external_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ResourceQuery>,
) -> Result<StatusCode> {
    let resource = query.required_resource()?;
    let removed = state.links.unlink(&caller.identity_id, resource).await?;
    debug!(identity = %caller.identity_id, resource = %resource, removed, "Unlink");
    Ok(StatusCode::OK)
}

/// Body of `POST /token`
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    /// `client_credentials` or `authorization_code`
    pub grant_type: Option<String>,
    /// Client id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<String>,
    /// Redirect URI used for the authorization request
    pub redirect_uri: Option<String>,
    /// Authorization code
    pub code: Option<String>,
}

/// Response of `POST /token`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OauthTokenResponse {
    /// Access token
    pub access_token: String,
    /// Expiry, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    /// Refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type
    pub token_type: String,
}

impl From<OAuthToken> for OauthTokenResponse {
    fn from(token: OAuthToken) -> Self {
        Self {
            access_token: token.access_token,
            expiry: token.expiry.map(|e| e.to_rfc3339()),
            refresh_token: token.refresh_token,
            token_type: token.token_type,
        }
    }
}

impl OauthTokenResponse {
    fn from_auth_token(token: AuthToken, now: DateTime<Utc>) -> Self {
        let expiry = i64::try_from(token.token.expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime));
        Self {
            access_token: token.token.access_token,
            expiry: expiry.map(|e| e.to_rfc3339()),
            refresh_token: token.token.refresh_token,
            token_type: token.token.token_type,
        }
    }
}

fn required<'a>(value: Option<&'a String>, name: &str) -> Result<&'a str> {
    value
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest(format!("'{name}' is required")))
}

/// POST /token
pub async fn token_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OauthTokenResponse>> {
    let request: TokenRequest = parse_body(&headers, &body)?;
    let grant: GrantType = required(request.grant_type.as_ref(), "grant_type")?.parse()?;
    let deadline = Instant::now() + state.upstream_deadline;

    let token = match grant {
        GrantType::ClientCredentials => {
            let client_id = required(request.client_id.as_ref(), "client_id")?;
            let secret = required(request.client_secret.as_ref(), "client_secret")?;
            client_credentials(&state, client_id, secret, deadline).await?
        }
        GrantType::AuthorizationCode => {
            let idp = state.idp.as_ref().ok_or_else(|| {
                Error::BadRequest(
                    "authorization_code grant requires an identity provider".to_string(),
                )
            })?;
            let client_id = required(request.client_id.as_ref(), "client_id")?;
            let code = required(request.code.as_ref(), "code")?;
            let redirect_uri = required(request.redirect_uri.as_ref(), "redirect_uri")?;
            if client_id != idp.provider.client_id {
                return Err(Error::Unauthorized("invalid client_id".to_string()));
            }

            let token = state
                .upstream
                .exchange_code(&idp.provider, code, redirect_uri, deadline)
                .await?;
            info!(client_id = %client_id, "Authorization code exchanged");
            OauthTokenResponse::from(token)
        }
    };

    Ok(Json(token))
}

async fn client_credentials(
    state: &AppState,
    client_id: &str,
    secret: &str,
    deadline: Instant,
) -> Result<OauthTokenResponse> {
    if !state.service_accounts.is_known(client_id)
        && let Some(IdentityProvider {
            provider,
            delegate_client_credentials: true,
        }) = state.idp.as_ref()
    {
        debug!(client_id = %client_id, "Delegating client_credentials to the identity provider");
        let token = state
            .upstream
            .client_credentials(provider, client_id, secret, deadline)
            .await?;
        return Ok(OauthTokenResponse::from(token));
    }

    let pat = state.service_accounts.issue_pat(client_id, secret)?;
    Ok(OauthTokenResponse::from_auth_token(pat, Utc::now()))
}

/// Decode a form or JSON body, chosen by `Content-Type`.
fn parse_body<T: DeserializeOwned + Default>(headers: &HeaderMap, body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Ok(T::default());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("application/json") {
        serde_json::from_slice(body)
            .map_err(|e| Error::BadRequest(format!("Invalid JSON body: {e}")))
    } else {
        serde_urlencoded::from_bytes(body)
            .map_err(|e| Error::BadRequest(format!("Invalid form body: {e}")))
    }
}

/// Query of `GET /token/keys`
#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    /// `pem` or `jwk` (default)
    pub format: Option<String>,
}

/// GET /token/keys
pub async fn public_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeysQuery>,
) -> Result<impl IntoResponse> {
    let format = match query.format.as_deref().map(str::trim) {
        None | Some("") => KeyFormat::default(),
        Some(value) => value.parse::<KeyFormat>().map_err(Error::BadRequest)?,
    };
    Ok(Json(state.keys.public_keys(format)))
}

/// GET /token/generate
pub async fn generate_dev_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AuthToken>>> {
    if !state.dev.enabled {
        return Err(Error::Unauthorized(
            "token generation is only available in development mode".to_string(),
        ));
    }

    let tokens = state
        .dev
        .identities
        .iter()
        .map(|identity| {
            let token = state.issuer.issue_session_token(identity)?;
            audit::emit(&AuditEvent::session_issued(identity));
            Ok(token)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Json(tokens))
}

/// Body of `POST /token/refresh`
#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    /// Refresh token
    pub refresh_token: Option<String>,
}

/// POST /token/refresh
pub async fn refresh_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AuthToken>> {
    let request: RefreshRequest = parse_body(&headers, &body)?;
    let refresh_token = required(request.refresh_token.as_ref(), "refresh_token")?;

    match state.issuer.refresh_session_token(refresh_token) {
        Ok(token) => {
            audit::emit(&AuditEvent::session_refreshed());
            Ok(Json(token))
        }
        Err(Error::Key(e)) if e.is_verification_failure() => {
            telemetry_metrics::counter!("token_verification_failures_total", "reason" => e.reason())
                .increment(1);
            audit::emit(&AuditEvent::token_rejected(e.reason()));
            Err(Error::Key(e))
        }
        Err(e) => Err(e),
    }
}

/// Query of `GET /token/link`
#[derive(Debug, Deserialize)]
pub struct LinkQuery {
    /// Comma-separated resource URLs
    #[serde(rename = "for")]
    pub resources: Option<String>,
    /// Where to go after linking
    pub redirect: Option<String>,
}

/// Response of `GET /token/link`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectLocation {
    /// Provider authorize URL
    pub redirect_location: String,
}

/// GET /token/link
pub async fn start_link(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Query(query): Query<LinkQuery>,
) -> Result<Json<RedirectLocation>> {
    let resources = query
        .resources
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("query parameter 'for' is required".to_string()))?;
    let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok());

    let url = state
        .links
        .start(&caller.identity_id, resources, query.redirect.as_deref(), referer)
        .await?;

    Ok(Json(RedirectLocation {
        redirect_location: url.to_string(),
    }))
}

/// Query of `GET /token/link/callback`
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Authorization code
    pub code: Option<String>,
    /// State token
    pub state: Option<String>,
}

/// GET /token/link/callback
pub async fn link_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let (Some(code), Some(link_state)) = (
        query.code.as_deref().filter(|c| !c.is_empty()),
        query.state.as_deref().filter(|s| !s.is_empty()),
    ) else {
        return Error::BadRequest("'code' and 'state' are required".to_string()).into_response();
    };

    let outcome = state.links.callback(code, link_state).await;
    debug!(phase = ?outcome.phase, "Link callback finished");
    Redirect::temporary(outcome.redirect.as_str()).into_response()
}

/// Fallback for unknown paths
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "errors": [{
                "status": "404",
                "code": "not_found",
                "title": "Not Found",
                "detail": "no such endpoint",
            }]
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_parsed_by_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let form: TokenRequest =
            parse_body(&headers, b"grant_type=client_credentials&client_id=ci-bot").unwrap();
        assert_eq!(form.grant_type.as_deref(), Some("client_credentials"));
        assert_eq!(form.client_id.as_deref(), Some("ci-bot"));

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let json: RefreshRequest = parse_body(&headers, br#"{"refresh_token":"r"}"#).unwrap();
        assert_eq!(json.refresh_token.as_deref(), Some("r"));

        assert!(matches!(
            parse_body::<RefreshRequest>(&headers, b"{not json"),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn link_challenge_points_at_link_endpoint() {
        let response = link_required(
            "https://broker.example.com/",
            "https://github.com",
            "no token linked".to_string(),
        );

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[header::WWW_AUTHENTICATE]
            .to_str()
            .unwrap();
        assert!(challenge.starts_with(
            "LINK url=\"https://broker.example.com/token/link?for=https%3A%2F%2Fgithub.com\""
        ));
    }

    #[test]
    fn pat_response_carries_rfc3339_expiry_and_no_refresh() {
        let now = Utc::now();
        let response = OauthTokenResponse::from_auth_token(
            AuthToken {
                token: crate::token::TokenData {
                    access_token: "a".to_string(),
                    expires_in: 60,
                    refresh_expires_in: 0,
                    refresh_token: None,
                    token_type: "Bearer".to_string(),
                    not_before_policy: 0,
                },
            },
            now,
        );

        let expiry = DateTime::parse_from_rfc3339(response.expiry.as_deref().unwrap()).unwrap();
        assert_eq!(expiry.timestamp(), now.timestamp() + 60);
        assert!(response.refresh_token.is_none());
    }
}

//! Shared fixtures: a mock OAuth provider and a fully wired broker router.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use token_broker::config::{
    Config, IdpConfig, ProviderConfig, ServiceAccountConfig,
};
use token_broker::gateway::{AppState, build_state, create_router};
use token_broker::token::GrantType;
use token_broker::token::service_account::hash_secret;
use token_broker::upstream::ProviderKind;

pub const GITHUB: &str = "https://github.com";
pub const OPENSHIFT: &str = "https://api.cluster.example.com";
pub const SUCCESS_URL: &str = "https://app.example.com/success";
pub const FAILURE_URL: &str = "https://app.example.com/failure";
pub const PUBLIC_URL: &str = "https://broker.example.com";

/// Knobs and counters of the mock provider
#[derive(Default)]
pub struct MockState {
    /// Requests to the token endpoint
    pub token_calls: AtomicUsize,
    /// Requests to the profile endpoint
    pub profile_calls: AtomicUsize,
    /// Answer this many token requests with 503 before behaving
    pub fail_remaining: AtomicUsize,
    /// Delay every token response by this many milliseconds
    pub delay_ms: AtomicU64,
}

/// Mock OAuth provider on an ephemeral local port
pub struct MockProvider {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockProvider {
    pub fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.state.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }
}

pub async fn start_mock_provider() -> MockProvider {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/authorize", get(|| async { "authorize" }))
        .route("/token", post(mock_token))
        .route("/user", get(mock_user))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockProvider {
        base_url: format!("http://{addr}"),
        state,
    }
}

/// Token endpoint.
///
/// authorization_code: code `bad` → 200 with an error body (GitHub style),
/// `rejected` → 400 invalid_grant, anything else → `gho_<code>` with
/// refresh token `r1` (`revoked` for codes ending in `revoked`, none for
/// codes ending in `norefresh`). `short*` codes expire in 30 s, `forever*`
/// codes carry an `expires_in` too large for any timestamp.
/// refresh_token: `revoked` → 400 invalid_grant, anything else →
/// `gho_refreshed` with a longer (string) expires_in and no new refresh token.
/// client_credentials: `partner`/`partner-secret` → `idp-token`, else 401.
async fn mock_token(
    State(state): State<Arc<MockState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if state
        .fail_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }

    let param = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();
    let invalid_grant = || {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "token revoked"})),
        )
            .into_response()
    };

    match param("grant_type") {
        "authorization_code" => match param("code") {
            "bad" => Json(json!({
                "error": "bad_verification_code",
                "error_description": "The code passed is incorrect or expired."
            }))
            .into_response(),
            "rejected" => invalid_grant(),
            code => {
                let expires_in = if code.starts_with("short") {
                    json!(30)
                } else if code.starts_with("forever") {
                    json!("9223372036854775807")
                } else {
                    json!(3600)
                };
                let mut body = json!({
                    "access_token": format!("gho_{code}"),
                    "token_type": "bearer",
                    "scope": "repo",
                    "expires_in": expires_in
                });
                if code.ends_with("revoked") {
                    body["refresh_token"] = json!("revoked");
                } else if !code.ends_with("norefresh") {
                    body["refresh_token"] = json!("r1");
                }
                Json(body).into_response()
            }
        },
        "refresh_token" => match param("refresh_token") {
            "revoked" => invalid_grant(),
            _ => Json(json!({
                "access_token": "gho_refreshed",
                "token_type": "bearer",
                "expires_in": "7200"
            }))
            .into_response(),
        },
        "client_credentials" => {
            if param("client_id") == "partner" && param("client_secret") == "partner-secret" {
                Json(json!({
                    "access_token": "idp-token",
                    "token_type": "Bearer",
                    "expires_in": 300
                }))
                .into_response()
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "invalid_client"})),
                )
                    .into_response()
            }
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "unsupported_grant_type"})),
        )
            .into_response(),
    }
}

async fn mock_user(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.profile_calls.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer gho_"));

    if authorized {
        Json(json!({"login": "octocat"})).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

fn provider_config(kind: ProviderKind, resource: &str, mock: &MockProvider) -> ProviderConfig {
    ProviderConfig {
        kind,
        resource: resource.to_string(),
        client_id: format!("{resource}-client"),
        client_secret: "provider-secret".to_string(),
        scope: None,
        authorize_url: Some(format!("{}/authorize", mock.base_url)),
        token_url: Some(format!("{}/token", mock.base_url)),
        profile_url: Some(format!("{}/user", mock.base_url)),
    }
}

/// Broker router wired against the mock provider
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub mock: MockProvider,
}

pub async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

pub async fn test_app_with(customize: impl FnOnce(&mut Config)) -> TestApp {
    let mock = start_mock_provider().await;

    let mut config = Config::default();
    config.server.public_url = PUBLIC_URL.to_string();
    config.link.success_redirect = SUCCESS_URL.to_string();
    config.link.failure_redirect = FAILURE_URL.to_string();
    config.upstream.request_timeout = Duration::from_millis(500);
    config.upstream.deadline = Duration::from_secs(3);
    config.upstream.retry.initial_backoff = Duration::from_millis(10);
    config.upstream.retry.max_backoff = Duration::from_millis(50);
    config.providers = vec![
        provider_config(ProviderKind::GitHub, GITHUB, &mock),
        provider_config(ProviderKind::OpenShift, OPENSHIFT, &mock),
    ];
    let mut idp = provider_config(
        ProviderKind::Keycloak,
        "https://sso.example.com/auth/realms/main",
        &mock,
    );
    idp.client_id = "broker".to_string();
    config.idp = Some(IdpConfig {
        provider: idp,
        delegate_client_credentials: true,
    });
    config.service_accounts = vec![
        ServiceAccountConfig {
            name: "ci".to_string(),
            client_id: "ci-bot".to_string(),
            client_secret_hash: hash_secret("s3cret"),
            grant_types: vec![GrantType::ClientCredentials],
        },
        ServiceAccountConfig {
            name: "web".to_string(),
            client_id: "web-app".to_string(),
            client_secret_hash: hash_secret("web-secret"),
            grant_types: vec![GrantType::AuthorizationCode],
        },
    ];
    config.dev.enabled = true;
    config.dev.identities = vec!["alice".to_string(), "bob".to_string()];

    customize(&mut config);

    let state = build_state(&config).await.unwrap();
    TestApp {
        router: create_router(Arc::clone(&state)),
        state,
        mock,
    }
}

/// Response pieces the tests look at
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn location(&self) -> &str {
        self.headers[header::LOCATION].to_str().unwrap()
    }
}

impl TestApp {
    /// Bearer access token for `identity`.
    pub fn session_token(&self, identity: &str) -> String {
        self.state
            .issuer
            .issue_session_token(identity)
            .unwrap()
            .token
            .access_token
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> TestResponse {
        let mut request = Request::get(uri);
        if let Some(token) = bearer {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }

    pub async fn delete(&self, uri: &str, bearer: &str) -> TestResponse {
        self.send(
            Request::delete(uri)
                .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_form(&self, uri: &str, form: &[(&str, &str)]) -> TestResponse {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(serde_urlencoded::to_string(form).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> TestResponse {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Start linking `resource` for `identity` and return the issued state.
    pub async fn start_link(&self, identity: &str, resource: &str) -> String {
        let token = self.session_token(identity);
        let response = self
            .get(&format!("/token/link?for={}", encode(resource)), Some(&token))
            .await;
        assert_eq!(response.status, StatusCode::OK, "{:?}", response.body);
        state_of(response.body["redirect_location"].as_str().unwrap())
    }
}

pub fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// `state` query parameter of an authorize URL.
pub fn state_of(url: &str) -> String {
    query_param(url, "state").expect("authorize URL carries a state")
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

//! Signing-key rotation, export and purge through the HTTP surface.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use pretty_assertions::assert_eq;

use common::{GITHUB, TestApp, encode, test_app, test_app_with};
use token_broker::gateway::run_maintenance;
use token_broker::keys::generate_key_file;

async fn exported_kids(app: &TestApp) -> Vec<String> {
    let response = app.get("/token/keys", None).await;
    assert_eq!(response.status, StatusCode::OK);
    response.body["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kid"].as_str().unwrap().to_string())
        .collect()
}

async fn link_status(app: &TestApp, bearer: &str) -> StatusCode {
    app.get(&format!("/token/link?for={}", encode(GITHUB)), Some(bearer))
        .await
        .status
}

#[tokio::test]
async fn rotation_exports_active_and_retired_keys() {
    // GIVEN: a token signed by the first key
    let app = test_app().await;
    let old_kid = app.state.keys.active_key().kid().to_string();
    let old_token = app.session_token("alice");

    // WHEN: the key rotates
    let new_kid = app.state.keys.rotate().unwrap().kid().to_string();

    // THEN: both keys are published, active first
    assert_eq!(exported_kids(&app).await, vec![new_kid, old_kid]);

    // AND: tokens from either key verify
    assert_eq!(link_status(&app, &old_token).await, StatusCode::OK);
    let new_token = app.session_token("alice");
    assert_eq!(link_status(&app, &new_token).await, StatusCode::OK);
}

#[tokio::test]
async fn purged_key_no_longer_verifies() {
    // GIVEN: a retired key with an outstanding token
    let app = test_app().await;
    let old_token = app.session_token("alice");
    let old_kid = app.state.keys.active_key().kid().to_string();
    app.state.keys.rotate().unwrap();

    // WHEN: the retention window has passed
    let purged = app
        .state
        .keys
        .purge(Utc::now() + chrono::Duration::days(400));

    // THEN: the retired key is gone from verification and export
    assert_eq!(purged, vec![old_kid.clone()]);
    assert!(!exported_kids(&app).await.contains(&old_kid));
    assert_eq!(link_status(&app, &old_token).await, StatusCode::UNAUTHORIZED);

    let new_token = app.session_token("alice");
    assert_eq!(link_status(&app, &new_token).await, StatusCode::OK);
}

#[tokio::test]
async fn maintenance_keeps_recently_retired_keys() {
    let app = test_app().await;
    app.state.keys.rotate().unwrap();

    run_maintenance(&app.state).await;

    assert_eq!(exported_kids(&app).await.len(), 2);
}

#[tokio::test]
async fn configured_key_file_is_used() {
    // GIVEN: a key generated ahead of time
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signing.pem");
    let kid = generate_key_file(&path).await.unwrap();

    // WHEN: the broker starts with it
    let key_path = path.clone();
    let app = test_app_with(move |config| config.keys.private_key_path = Some(key_path)).await;

    // THEN: it signs with that key
    assert_eq!(exported_kids(&app).await, vec![kid.clone()]);

    // AND: generating over it is refused
    assert!(generate_key_file(&path).await.is_err());
}

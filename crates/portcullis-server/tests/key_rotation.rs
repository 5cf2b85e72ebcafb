//! Signing-key rotation as seen by token holders and JWKS consumers.

mod common;

use axum::http::{header, StatusCode};
use chrono::{Duration, Utc};
use serde_json::json;

use common::*;
use portcullis_server::auth::tokens::AccessClaims;

fn kids(jwks: &jsonwebtoken::jwk::JwkSet) -> Vec<String> {
    jwks.keys
        .iter()
        .filter_map(|k| k.common.key_id.clone())
        .collect()
}

async fn password_grant(server: &TestServer) -> serde_json::Value {
    let response = server
        .send(json_post(
            "/oauth/token",
            json!({
                "grant_type": "password",
                "client_id": "acme-app",
                "username": "jane@example.com",
                "password": PASSWORD,
                "scope": "openid"
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn tokens_survive_rotation_until_horizon() {
    let server = TestServer::start("rotation-continuity").await;
    server.add_password_user("acme", "jane@example.com").await;
    let keys = &server.state.keys;

    let old = keys.active().await.unwrap();
    let before = password_grant(&server).await;

    let new = keys.rotate().await.unwrap();
    assert_ne!(old.kid, new.kid);
    assert_eq!(keys.active().await.unwrap().kid, new.kid);

    // The retired key stays published, so the earlier token still verifies.
    let published = kids(&keys.jwks().await.unwrap());
    assert_eq!(published, vec![new.kid.clone(), old.kid.clone()]);
    let claims: AccessClaims = server
        .state
        .minter
        .verify(before["access_token"].as_str().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(claims.azp, "acme-app");

    let after = password_grant(&server).await;
    let header = jsonwebtoken::decode_header(after["access_token"].as_str().unwrap()).unwrap();
    assert_eq!(header.kid.as_deref(), Some(new.kid.as_str()));

    let horizon = server.state.config.jwks_cache_horizon;
    let later = Utc::now() + horizon + Duration::seconds(1);
    assert_eq!(kids(&keys.jwks_at(later).await.unwrap()), vec![new.kid]);
}

#[tokio::test]
async fn published_jwks_matches_key_manager() {
    let server = TestServer::start("rotation-jwks").await;
    server.state.keys.rotate().await.unwrap();

    let response = server.send(get("/.well-known/jwks.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cache_control = response.headers()[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(cache_control, "public, max-age=600");

    let body = body_json(response).await;
    let served: Vec<&str> = body["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kid"].as_str().unwrap())
        .collect();
    let expected = kids(&server.state.keys.jwks().await.unwrap());
    assert_eq!(served, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(body["keys"]
        .as_array()
        .unwrap()
        .iter()
        .all(|k| k["kty"] == "EC" && k["crv"] == "P-256"));
}

//! Well-known endpoints for token verifiers and OIDC clients
//!
//! Implements:
//! - /.well-known/jwks.json - published signing keys
//! - /.well-known/openid-configuration - discovery document

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use super::error_response;
use crate::server::AuthState;

/// Create the well-known router
pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/.well-known/openid-configuration", get(openid_configuration_handler))
        .with_state(state)
}

/// GET /.well-known/jwks.json
///
/// Cacheable for at most the revocation horizon, so that verifiers never
/// hold a key set older than the window in which revoked keys stay listed.
async fn jwks_handler(State(state): State<Arc<AuthState>>) -> Response {
    match state.keys.jwks().await {
        Ok(jwks) => {
            let max_age = state.config.jwks_cache_horizon.num_seconds().max(0);
            (
                StatusCode::OK,
                [(header::CACHE_CONTROL, format!("public, max-age={}", max_age))],
                Json(jwks),
            )
                .into_response()
        }
        Err(err) => error_response(err),
    }
}

/// GET /.well-known/openid-configuration
async fn openid_configuration_handler(State(state): State<Arc<AuthState>>) -> Response {
    let config = &state.config;
    let document = json!({
        "issuer": config.issuer,
        "authorization_endpoint": config.url("authorize"),
        "token_endpoint": config.url("oauth/token"),
        "userinfo_endpoint": config.url("userinfo"),
        "jwks_uri": config.url(".well-known/jwks.json"),
        "end_session_endpoint": config.url("v2/logout"),
        "response_types_supported": ["code", "token", "id_token", "token id_token"],
        "response_modes_supported": ["query", "fragment", "form_post", "web_message"],
        "grant_types_supported": [
            "authorization_code",
            "password",
            "client_credentials",
            "refresh_token",
            "http://auth0.com/oauth/grant-type/password-realm"
        ],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["ES256"],
        "scopes_supported": ["openid", "profile", "email", "offline_access"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post", "none"],
        "code_challenge_methods_supported": ["S256", "plain"],
        "claims_supported": [
            "sub", "iss", "aud", "exp", "iat", "nonce", "sid",
            "email", "email_verified", "name", "nickname", "picture", "locale"
        ]
    });
    (StatusCode::OK, Json(document)).into_response()
}

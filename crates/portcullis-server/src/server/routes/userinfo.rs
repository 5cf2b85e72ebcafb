//! `GET /userinfo`: profile of the user behind a bearer access token.

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::instrument;

use super::error_response;
use crate::auth::tokens::AccessClaims;
use crate::auth::{AuthError, ResolvedUser};
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/userinfo", get(userinfo_handler))
        .with_state(state)
}

fn profile(resolved: &ResolvedUser) -> Result<Value, AuthError> {
    let user = &resolved.user;
    let mut claims = Map::new();
    claims.insert("sub".into(), Value::String(user.id.clone()));
    if let Some(email) = &user.email {
        claims.insert("email".into(), Value::String(email.clone()));
        claims.insert("email_verified".into(), Value::Bool(user.email_verified));
    }
    for (key, value) in [
        ("name", &user.name),
        ("nickname", &user.nickname),
        ("picture", &user.picture),
        ("locale", &user.locale),
    ] {
        if let Some(v) = value {
            claims.insert(key.into(), Value::String(v.clone()));
        }
    }
    claims.insert(
        "updated_at".into(),
        Value::String(user.updated_at.to_rfc3339()),
    );
    let identities = serde_json::to_value(&resolved.identities)
        .map_err(|e| AuthError::Internal(format!("Failed to encode identities: {}", e)))?;
    claims.insert("identities".into(), identities);
    Ok(Value::Object(claims))
}

#[instrument(skip_all)]
async fn userinfo_handler(State(state): State<Arc<AuthState>>, headers: HeaderMap) -> Response {
    let result = userinfo(&state, &headers).await;
    match result {
        Ok(profile) => Json(profile).into_response(),
        Err(err) => error_response(err),
    }
}

async fn userinfo(state: &AuthState, headers: &HeaderMap) -> Result<Value, AuthError> {
    let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() else {
        return Err(AuthError::Jwt("missing bearer token".to_string()));
    };
    let claims: AccessClaims = state.minter.verify(bearer.token(), None).await?;
    if claims.sub.ends_with("@clients") {
        return Err(AuthError::Jwt("token has no user".to_string()));
    }

    let (_application, tenant) = state.authorizer.load_client(&claims.azp).await?;
    let resolved = state.identity.resolve_by_id(&tenant.id, &claims.sub).await?;
    profile(&resolved)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::json;

    async fn password_token(app: &TestApp) -> String {
        let response = send(
            &app.router,
            json_post(
                "/oauth/token",
                json!({
                    "grant_type": "password",
                    "client_id": "acme-app",
                    "username": "john@example.com",
                    "password": "correct horse",
                    "scope": "openid"
                }),
            ),
        )
        .await;
        body_json(response).await["access_token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn returns_profile_for_valid_token() {
        let app = test_app().await;
        let token = password_token(&app).await;
        let response = send(
            &app.router,
            Request::builder()
                .uri("/userinfo")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["email"], "john@example.com");
        assert!(json["sub"].as_str().unwrap().starts_with("auth2|"));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let app = test_app().await;
        let response = send(&app.router, get("/userinfo")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use super::{error_response, json_body};
use crate::auth::signup::SignupResult;
use crate::auth::AuthError;
use crate::model::DATABASE_CONNECTION;
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/dbconnections/signup", post(signup_handler))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct SignupRequest {
    pub client_id: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub connection: Option<String>,
}

/// POST /dbconnections/signup
async fn signup_handler(
    State(state): State<Arc<AuthState>>,
    body: Result<Json<SignupRequest>, JsonRejection>,
) -> Response {
    let result = match json_body(body) {
        Ok(request) => signup(&state, request).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(created) => Json(created).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(skip_all, fields(client_id = %request.client_id))]
async fn signup(state: &AuthState, request: SignupRequest) -> Result<SignupResult, AuthError> {
    let (application, _tenant) = state.authorizer.load_client(&request.client_id).await?;
    let connection = request.connection.as_deref().unwrap_or(DATABASE_CONNECTION);
    state
        .signup
        .signup(&application, &request.email, &request.password, connection)
        .await
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    fn signup(email: &str, password: &str) -> axum::http::Request<axum::body::Body> {
        json_post(
            "/dbconnections/signup",
            json!({
                "client_id": "acme-app",
                "email": email,
                "password": password,
                "connection": "Username-Password-Authentication"
            }),
        )
    }

    #[tokio::test]
    async fn signup_returns_local_id_and_lowercased_email() {
        let app = test_app().await;
        let response = send(&app.router, signup("Jane@Example.COM", "pw")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["email"], "jane@example.com");
        assert_eq!(json["email_verified"], false);
        assert!(!json["_id"].as_str().unwrap().contains('|'));
    }

    #[tokio::test]
    async fn re_registration_succeeds_and_new_password_logs_in() {
        let app = test_app().await;
        let response = send(&app.router, signup("john@example.com", "brand new")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &app.router,
            json_post(
                "/co/authenticate",
                json!({
                    "client_id": "acme-app",
                    "credential_type": "password",
                    "username": "john@example.com",
                    "password": "brand new"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn signup_without_password_is_bad_request() {
        let app = test_app().await;
        let response = send(
            &app.router,
            json_post(
                "/dbconnections/signup",
                json!({"client_id": "acme-app", "email": "jane@example.com"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_request");
    }
}

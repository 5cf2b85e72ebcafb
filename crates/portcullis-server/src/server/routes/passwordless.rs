//! Passwordless email endpoints:
//! - POST /passwordless/start - send a one-time code or magic link
//! - GET /passwordless/verify_redirect - magic link target

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::instrument;

use super::{completion_response, error_response, json_body};
use crate::auth::authorize::merge_params;
use crate::auth::AuthError;
use crate::model::{normalize_email, AuthParams, OtpDelivery, EMAIL_CONNECTION};
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/passwordless/start", post(start_handler))
        .route("/passwordless/verify_redirect", get(verify_redirect_handler))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct StartRequest {
    pub client_id: String,
    pub connection: String,
    pub email: String,
    #[serde(default)]
    pub send: Option<String>,
    #[serde(default, rename = "authParams")]
    pub auth_params: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub struct VerifyRedirectQuery {
    pub verification_code: String,
    pub email: String,
    #[serde(flatten)]
    pub params: AuthParams,
}

async fn start_handler(
    State(state): State<Arc<AuthState>>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let result = match json_body(body) {
        Ok(request) => start(&state, request).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(email) => Json(json!({ "email": email })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(skip_all, fields(client_id = %request.client_id))]
async fn start(state: &AuthState, request: StartRequest) -> Result<String, AuthError> {
    if request.connection != EMAIL_CONNECTION {
        return Err(AuthError::Validation(format!(
            "Unsupported passwordless connection: {}",
            request.connection
        )));
    }
    let send = match request.send.as_deref() {
        None => OtpDelivery::Code,
        Some(raw) => OtpDelivery::parse(raw)
            .ok_or_else(|| AuthError::Validation(format!("Unsupported send value: {}", raw)))?,
    };

    let (application, _tenant) = state.authorizer.load_client(&request.client_id).await?;

    let mut raw_params = request.auth_params.unwrap_or_default();
    raw_params.insert(
        "client_id".to_string(),
        Value::String(application.id.clone()),
    );
    let auth_params: AuthParams = serde_json::from_value(Value::Object(raw_params))
        .map_err(|e| AuthError::Validation(format!("Invalid authParams: {}", e)))?;

    state
        .passwordless
        .start(&application, &request.email, send, auth_params)
        .await?;
    Ok(normalize_email(&request.email))
}

#[instrument(skip_all, fields(client_id = %query.params.client_id))]
async fn verify_redirect_handler(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Query(query): Query<VerifyRedirectQuery>,
) -> Response {
    let result = verify_redirect(&state, query).await;
    match result {
        Ok(completion) => completion_response(&state, jar, completion),
        Err(err) => error_response(err),
    }
}

async fn verify_redirect(
    state: &AuthState,
    query: VerifyRedirectQuery,
) -> Result<crate::auth::Completion, AuthError> {
    let (_application, tenant) = state.authorizer.load_client(&query.params.client_id).await?;
    let verified = state
        .passwordless
        .verify(&tenant.id, &query.email, &query.verification_code)
        .await?;

    let params = match verified.auth_params {
        Some(stored) => merge_params(query.params, stored),
        None => query.params,
    };
    state.authorizer.complete_login(params, &verified.user).await
}

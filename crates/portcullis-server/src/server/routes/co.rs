//! `POST /co/authenticate`: verifies a credential for an embedded login
//! widget and answers with a login ticket to redeem at `/authorize`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use super::{error_response, header_str, json_body};
use crate::auth::{AuthError, Credential};
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/co/authenticate", post(authenticate_handler))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct CoAuthenticateRequest {
    pub client_id: String,
    pub username: Option<String>,
    pub credential_type: String,
    pub realm: Option<String>,
    pub password: Option<String>,
    pub otp: Option<String>,
}

async fn authenticate_handler(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
    body: Result<Json<CoAuthenticateRequest>, JsonRejection>,
) -> Response {
    let result = match json_body(body) {
        Ok(request) => authenticate(&state, &headers, request).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(ticket) => Json(ticket).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(skip_all, fields(client_id = %request.client_id, credential_type = %request.credential_type))]
async fn authenticate(
    state: &AuthState,
    headers: &HeaderMap,
    request: CoAuthenticateRequest,
) -> Result<crate::auth::IssuedTicket, AuthError> {
    let (application, _tenant) = state.authorizer.load_client(&request.client_id).await?;

    if let Some(origin) = header_str(headers, header::ORIGIN.as_str()) {
        if !application.allows_origin(origin) {
            return Err(AuthError::Authorization(format!(
                "Origin {} not allowed",
                origin
            )));
        }
    }

    let credential = Credential::from_request(
        &request.credential_type,
        request.username,
        request.realm,
        request.password,
        request.otp,
    )?;
    state.tickets.authenticate(&application, &credential).await
}

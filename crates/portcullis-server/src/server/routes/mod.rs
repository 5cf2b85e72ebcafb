// Route modules for the identity provider endpoints
pub mod authorize; // /authorize
pub mod callback; // federated provider redirect target
pub mod co; // cross-origin credential check, login tickets
pub mod dbconnections; // username-password signup
pub mod logout; // /v2/logout
pub mod passwordless; // email codes and magic links
pub mod token; // /oauth/token
pub mod universal; // hosted login pages
pub mod userinfo;
pub mod well_known; // JWKS and discovery

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use tracing::{error, warn};

use crate::auth::session::session_cookie;
use crate::auth::{AuthError, AuthorizeOutcome, Completion};
use crate::server::{response, AuthState};

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: String,
}

/// Convert AuthError to HTTP response
pub fn auth_error_to_response(err: AuthError) -> (StatusCode, Json<ErrorResponse>) {
    let status = err.status();
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!(code = err.code(), "Request rejected: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.code().to_string(),
            error_description: err.public_description(),
        }),
    )
}

pub fn error_response(err: AuthError) -> Response {
    auth_error_to_response(err).into_response()
}

/// A JSON body the extractor could not read is an `invalid_request`.
pub fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    body.map(|Json(request)| request)
        .map_err(|e| AuthError::Validation(e.body_text()))
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Reads a cookie value by name.
pub fn cookie_value(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name).map(|c| c.value().to_string())
}

/// Delivers a finished flow, setting the session cookie when a session was
/// opened.
pub fn completion_response(state: &AuthState, jar: CookieJar, completion: Completion) -> Response {
    let jar = match completion.session_token.as_deref() {
        Some(token) => jar.add(session_cookie(
            &completion.tenant_id,
            token,
            state.config.secure_cookies(),
        )),
        None => jar,
    };
    (jar, response::render(&completion.response)).into_response()
}

pub fn outcome_response(state: &AuthState, jar: CookieJar, outcome: AuthorizeOutcome) -> Response {
    match outcome {
        AuthorizeOutcome::LoginPage { url }
        | AuthorizeOutcome::ConfirmAccount { url }
        | AuthorizeOutcome::FederatedRedirect { url } => response::found(&url),
        AuthorizeOutcome::Complete(completion) => completion_response(state, jar, completion),
        AuthorizeOutcome::LoginRequired(login_required) => response::render(&login_required),
    }
}

//! `GET /v2/logout`: ends the tenant SSO session.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};

use super::{cookie_value, error_response};
use crate::auth::session::{cookie_name, removal_cookie};
use crate::auth::AuthError;
use crate::server::{response, AuthState};

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/v2/logout", get(logout_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct LogoutQuery {
    pub client_id: String,
    #[serde(rename = "returnTo")]
    pub return_to: Option<String>,
}

#[instrument(skip_all, fields(client_id = %query.client_id))]
async fn logout_handler(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Query(query): Query<LogoutQuery>,
) -> Response {
    let (application, tenant) = match state.authorizer.load_client(&query.client_id).await {
        Ok(found) => found,
        Err(err) => return error_response(err),
    };

    if let Some(return_to) = query.return_to.as_deref() {
        if !application.allows_logout_url(return_to) {
            return error_response(AuthError::Validation(format!(
                "returnTo is not an allowed logout URL: {}",
                return_to
            )));
        }
    }

    if let Some(token) = cookie_value(&jar, &cookie_name(&tenant.id)) {
        if let Err(err) = state.sessions.logout(&tenant.id, &token).await {
            return error_response(err);
        }
    }
    info!(tenant_id = %tenant.id, "Logged out");

    let jar = jar.add(removal_cookie(&tenant.id, state.config.secure_cookies()));
    match query.return_to.as_deref() {
        Some(return_to) => (jar, response::found(return_to)).into_response(),
        None => (jar, Json(json!({ "status": "logged_out" }))).into_response(),
    }
}

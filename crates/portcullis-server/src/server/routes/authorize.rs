//! `GET /authorize` and `POST /authorize`.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Form, Router,
};
use axum_extra::extract::cookie::CookieJar;
use std::sync::Arc;
use tracing::instrument;

use super::{cookie_value, error_response, header_str, outcome_response};
use crate::auth::AuthorizeRequest;
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/authorize", get(authorize_get).post(authorize_post))
        .with_state(state)
}

async fn authorize_get(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    authorize(&state, jar, &headers, request).await
}

async fn authorize_post(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Form(request): Form<AuthorizeRequest>,
) -> Response {
    authorize(&state, jar, &headers, request).await
}

#[instrument(skip_all, fields(client_id = request.client_id.as_deref().unwrap_or_default()))]
async fn authorize(
    state: &AuthState,
    jar: CookieJar,
    headers: &HeaderMap,
    request: AuthorizeRequest,
) -> Response {
    let origin = header_str(headers, header::ORIGIN.as_str());
    let tenant_header = header_str(headers, "tenant-id");

    let result = state
        .authorizer
        .authorize(
            &request,
            |name: &str| cookie_value(&jar, name),
            origin,
            tenant_header,
        )
        .await;

    match result {
        Ok(outcome) => outcome_response(state, jar, outcome),
        Err(err) => error_response(err),
    }
}

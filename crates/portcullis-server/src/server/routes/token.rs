//! `POST /oauth/token`.
//!
//! Accepts form or JSON bodies; client credentials may come from HTTP Basic
//! authentication instead of the body.

use axum::{
    extract::{FromRequest, Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::post,
    Form, Router,
};
use axum_extra::headers::{authorization::Basic, Authorization, HeaderMapExt};
use std::sync::Arc;

use super::error_response;
use crate::auth::{AuthError, TokenRequest};
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/oauth/token", post(token_handler))
        .with_state(state)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

async fn parse_request(request: Request) -> Result<TokenRequest, AuthError> {
    let headers = request.headers().clone();
    let parsed = if is_json(&headers) {
        Json::<TokenRequest>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .map_err(|e| AuthError::Validation(e.body_text()))?
    } else {
        Form::<TokenRequest>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .map_err(|e| AuthError::Validation(e.body_text()))?
    };

    Ok(match headers.typed_get::<Authorization<Basic>>() {
        Some(Authorization(basic)) => {
            parsed.with_basic_auth(basic.username().to_string(), basic.password().to_string())
        }
        None => parsed,
    })
}

async fn token_handler(State(state): State<Arc<AuthState>>, request: Request) -> Response {
    let request = match parse_request(request).await {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };

    let result = state.grants.handle(request).await;
    match result {
        Ok(tokens) => {
            let mut response = Json(tokens).into_response();
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        Err(err) => error_response(err),
    }
}

//! `GET /callback` and `POST /callback`: where federated providers send
//! the browser back.

use axum::{
    extract::{Query, State},
    response::Response,
    routing::get,
    Form, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use super::{completion_response, error_response};
use crate::auth::social::SocialState;
use crate::auth::AuthError;
use crate::server::AuthState;

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/callback", get(callback_get).post(callback_post))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

async fn callback_get(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    callback(&state, jar, params).await
}

async fn callback_post(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Form(params): Form<CallbackParams>,
) -> Response {
    callback(&state, jar, params).await
}

#[instrument(skip_all, fields(provider_error = params.error.as_deref()))]
async fn callback(state: &AuthState, jar: CookieJar, params: CallbackParams) -> Response {
    let social_state = match params
        .state
        .as_deref()
        .ok_or_else(|| AuthError::Validation("Missing required parameter: state".to_string()))
        .and_then(SocialState::decode)
    {
        Ok(social_state) => social_state,
        Err(err) => return error_response(err),
    };

    let provider_error = params.error.as_deref().map(|error| {
        (
            error,
            params.error_description.as_deref().unwrap_or_default(),
        )
    });

    let result = state
        .authorizer
        .complete_social(social_state, params.code.as_deref(), provider_error)
        .await;
    match result {
        Ok(completion) => completion_response(state, jar, completion),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::auth::social::SocialState;
    use crate::model::AuthParams;
    use axum::http::StatusCode;

    fn encoded_state(connection: &str) -> String {
        SocialState {
            auth_params: AuthParams {
                client_id: "acme-app".to_string(),
                redirect_uri: Some(CALLBACK.to_string()),
                response_type: Some("code".to_string()),
                state: Some("client-state".to_string()),
                ..Default::default()
            },
            connection: connection.to_string(),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_connection_is_forbidden() {
        let app = test_app().await;
        let uri = format!(
            "/callback?state={}&code=abc",
            urlencoding::encode(&encoded_state("github"))
        );
        let response = send(&app.router, get(&uri)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await["error_description"],
            "Connection not found"
        );
    }

    #[tokio::test]
    async fn garbage_state_is_bad_request() {
        let app = test_app().await;
        let response = send(&app.router, get("/callback?state=!!!!&code=abc")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn connection_of_wrong_strategy_is_forbidden() {
        let app = test_app().await;
        let response = send(
            &app.router,
            form_post(
                "/callback",
                &[("state", encoded_state("email").as_str()), ("code", "abc")],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}

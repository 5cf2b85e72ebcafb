//! Hosted login pages.
//!
//! Markup is minimal; a deployment's own UI posts to the same forms.
//!
//! - GET/POST /u/login - username and password form
//! - GET/POST /u/check-account - "continue as" when `login_hint` differs
//!   from the signed-in user
//! - GET /u/verify-email - target of the signup verification link

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use super::{completion_response, cookie_value, error_response, outcome_response};
use crate::auth::{AuthError, WRONG_PASSWORD};
use crate::server::{response, AuthState};

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/u/login", get(login_page).post(login_submit))
        .route("/u/check-account", get(check_account_page).post(check_account_submit))
        .route("/u/verify-email", get(verify_email_handler))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct StateQuery {
    pub state: String,
}

#[derive(Deserialize)]
pub struct LoginForm {
    pub state: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct CheckAccountForm {
    pub state: String,
    pub action: String,
}

#[derive(Deserialize)]
pub struct VerifyEmailQuery {
    pub ticket: String,
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head><meta charset="utf-8" /><title>{}</title></head>
  <body>
{}
  </body>
</html>"#,
        html_escape::encode_text(title),
        body
    )
}

fn login_form(state: &str, error: Option<&str>) -> String {
    let error = error
        .map(|e| format!(r#"    <p class="error">{}</p>"#, html_escape::encode_text(e)))
        .unwrap_or_default();
    page(
        "Log in",
        &format!(
            r#"{}
    <form method="post" action="/u/login">
      <input type="hidden" name="state" value="{}" />
      <input type="email" name="username" autocomplete="username" />
      <input type="password" name="password" autocomplete="current-password" />
      <button type="submit">Continue</button>
    </form>"#,
            error,
            html_escape::encode_double_quoted_attribute(state)
        ),
    )
}

fn check_account_form(state: &str, email: &str) -> String {
    let state = html_escape::encode_double_quoted_attribute(state);
    page(
        "Continue",
        &format!(
            r#"    <form method="post" action="/u/check-account">
      <input type="hidden" name="state" value="{state}" />
      <p>Continue as {email}?</p>
      <button type="submit" name="action" value="continue">Continue</button>
      <button type="submit" name="action" value="switch">Use another account</button>
    </form>"#,
            state = state,
            email = html_escape::encode_text(email)
        ),
    )
}

/// GET /u/login
async fn login_page(
    State(state): State<Arc<AuthState>>,
    Query(query): Query<StateQuery>,
) -> Response {
    match state.authorizer.login_session(&query.state).await {
        Ok(login) => Html(login_form(&login.id, None)).into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /u/login
#[instrument(skip_all)]
async fn login_submit(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let result = state
        .authorizer
        .login_with_password(&form.state, &form.username, &form.password)
        .await;
    match result {
        Ok(completion) => completion_response(&state, jar, completion),
        Err(AuthError::Authentication(_)) => (
            StatusCode::FORBIDDEN,
            Html(login_form(&form.state, Some(WRONG_PASSWORD))),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /u/check-account
async fn check_account_page(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Query(query): Query<StateQuery>,
) -> Response {
    let result = state
        .authorizer
        .session_email(&query.state, |name: &str| cookie_value(&jar, name))
        .await;
    match result {
        Ok(Some(email)) => Html(check_account_form(&query.state, &email)).into_response(),
        Ok(None) => response::found(&state.authorizer.login_page_url(&query.state)),
        Err(err) => error_response(err),
    }
}

/// POST /u/check-account
#[instrument(skip_all, fields(action = %form.action))]
async fn check_account_submit(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Form(form): Form<CheckAccountForm>,
) -> Response {
    match form.action.as_str() {
        "continue" => {
            let result = state
                .authorizer
                .continue_session(&form.state, |name: &str| cookie_value(&jar, name))
                .await;
            match result {
                Ok(outcome) => outcome_response(&state, jar, outcome),
                Err(err) => error_response(err),
            }
        }
        "switch" => match state.authorizer.login_session(&form.state).await {
            Ok(login) => response::found(&state.authorizer.login_page_url(&login.id)),
            Err(err) => error_response(err),
        },
        other => error_response(AuthError::Validation(format!("Unknown action: {}", other))),
    }
}

/// GET /u/verify-email
#[instrument(skip_all)]
async fn verify_email_handler(
    State(state): State<Arc<AuthState>>,
    Query(query): Query<VerifyEmailQuery>,
) -> Response {
    match state.signup.verify_email_ticket(&query.ticket).await {
        Ok(_) => Html(page(
            "Email verified",
            "    <p>Your email address has been verified.</p>",
        ))
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::auth::EmailKind;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::json;

    async fn login_state(app: &TestApp, extra: &str) -> String {
        let uri = format!(
            "/authorize?client_id=acme-app&redirect_uri={}&response_type=code&state=s1{}",
            urlencoding::encode(CALLBACK),
            extra
        );
        let location = location(&send(&app.router, get(&uri)).await);
        url::Url::parse(&location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn login_form_round_trip_sets_session() {
        let app = test_app().await;
        let state = login_state(&app, "").await;

        let page = body_string(send(&app.router, get(&format!("/u/login?state={}", state))).await).await;
        assert!(page.contains(r#"name="password""#));

        let response = send(
            &app.router,
            form_post(
                "/u/login",
                &[
                    ("state", state.as_str()),
                    ("username", "john@example.com"),
                    ("password", "correct horse"),
                ],
            ),
        )
        .await;
        assert!(set_cookie(&response).unwrap().starts_with("acme-auth-token="));
        let params = redirect_params(&location(&response));
        assert_eq!(params["state"], "s1");
        assert!(params.contains_key("code"));
    }

    #[tokio::test]
    async fn wrong_password_rerenders_form() {
        let app = test_app().await;
        let state = login_state(&app, "").await;
        let response = send(
            &app.router,
            form_post(
                "/u/login",
                &[
                    ("state", state.as_str()),
                    ("username", "john@example.com"),
                    ("password", "nope"),
                ],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_string(response).await.contains("Wrong email or password."));
    }

    #[tokio::test]
    async fn login_hint_mismatch_offers_continue_as() {
        let app = test_app().await;
        let state = login_state(&app, "").await;
        let response = send(
            &app.router,
            form_post(
                "/u/login",
                &[
                    ("state", state.as_str()),
                    ("username", "john@example.com"),
                    ("password", "correct horse"),
                ],
            ),
        )
        .await;
        let cookie = set_cookie(&response).unwrap();

        let uri = format!(
            "/authorize?client_id=acme-app&redirect_uri={}&response_type=code&login_hint=other%40example.com",
            urlencoding::encode(CALLBACK)
        );
        let response = send(
            &app.router,
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, cookie.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let check = location(&response);
        assert!(check.starts_with("https://id.example.com/u/check-account?state="));
        let path = check.strip_prefix("https://id.example.com").unwrap().to_string();
        let check_state = url::Url::parse(&check)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let page = send(
            &app.router,
            Request::builder()
                .uri(path)
                .header(header::COOKIE, cookie.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(body_string(page).await.contains("Continue as john@example.com?"));

        let mut request = form_post(
            "/u/check-account",
            &[("state", check_state.as_str()), ("action", "continue")],
        );
        request
            .headers_mut()
            .insert(header::COOKIE, cookie.parse().unwrap());
        let response = send(&app.router, request).await;
        assert!(redirect_params(&location(&response)).contains_key("code"));
    }

    #[tokio::test]
    async fn verify_email_link_marks_user_verified() {
        let app = test_app().await;
        send(
            &app.router,
            json_post(
                "/dbconnections/signup",
                json!({
                    "client_id": "acme-app",
                    "email": "fresh@example.com",
                    "password": "pw"
                }),
            ),
        )
        .await;
        let EmailKind::VerifyEmail { link } =
            app.mailer.last_to("fresh@example.com").await.unwrap().kind
        else {
            panic!("expected verification email");
        };
        let path = link.strip_prefix("https://id.example.com").unwrap();
        let response = send(&app.router, get(path)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("verified"));
    }
}

//! Plain OAuth2 legs shared by every provider: the code exchange, the
//! profile fetch and profile normalization.

use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;

use super::providers::SocialProvider;
use super::SocialProfile;
use crate::auth::AuthError;

/// Token endpoint response. Only the fields the adapter reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Converts a failed provider response into `AuthError::Upstream`. The
/// provider's `error` and `error_description` pass through when present.
pub(crate) async fn provider_error(endpoint: &str, res: Response) -> AuthError {
    let status = res.status();
    let body: Value = res.json().await.unwrap_or(Value::Null);
    let error = claim_str(&body, "error").unwrap_or_else(|| "server_error".to_string());
    let description = claim_str(&body, "error_description")
        .unwrap_or_else(|| format!("{} returned {}", endpoint, status));
    AuthError::upstream(error, description)
}

#[tracing::instrument(skip_all, fields(strategy = %provider.strategy))]
pub async fn exchange_code(
    client: &Client,
    provider: &SocialProvider,
    token_endpoint: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<ProviderTokens, AuthError> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", provider.client_id.as_str()),
    ];
    if let Some(secret) = provider.token_request_secret() {
        form.push(("client_secret", secret));
    }

    let res = client
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&form)
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(provider_error("token endpoint", res).await);
    }

    res.json::<ProviderTokens>()
        .await
        .map_err(|e| AuthError::upstream("server_error", format!("Invalid token response: {}", e)))
}

pub async fn fetch_profile(
    client: &Client,
    endpoint: &str,
    access_token: &str,
) -> Result<Value, AuthError> {
    let res = client
        .get(endpoint)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .header(reqwest::header::USER_AGENT, "portcullis")
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(provider_error("userinfo endpoint", res).await);
    }

    res.json::<Value>()
        .await
        .map_err(|e| AuthError::upstream("server_error", format!("Invalid profile response: {}", e)))
}

/// String form of a claim; numbers count, since some providers use numeric
/// ids.
pub(crate) fn claim_str(profile: &Value, key: &str) -> Option<String> {
    match profile.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn claim_bool(profile: &Value, key: &str) -> Option<bool> {
    match profile.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `picture` is a URL for OIDC providers and `{data: {url}}` for Facebook;
/// GitHub calls it `avatar_url`.
fn picture(profile: &Value) -> Option<String> {
    claim_str(profile, "picture")
        .or_else(|| {
            profile
                .pointer("/picture/data/url")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| claim_str(profile, "avatar_url"))
}

/// Maps a provider profile onto `SocialProfile`.
pub fn normalize_profile(
    provider: &SocialProvider,
    issuer: Option<String>,
    profile: Value,
) -> Result<SocialProfile, AuthError> {
    let subject = claim_str(&profile, &provider.subject_claim).ok_or_else(|| {
        AuthError::upstream(
            "invalid_request",
            format!("Profile has no '{}' claim", provider.subject_claim),
        )
    })?;

    Ok(SocialProfile {
        subject,
        issuer,
        email: claim_str(&profile, "email"),
        email_verified: claim_bool(&profile, "email_verified"),
        name: claim_str(&profile, "name"),
        nickname: claim_str(&profile, "nickname")
            .or_else(|| claim_str(&profile, "preferred_username"))
            .or_else(|| claim_str(&profile, "login")),
        picture: picture(&profile),
        raw: profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::social::providers::tests::{github, google};
    use crate::auth::social::providers::ClientAuth;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REDIRECT: &str = "https://id.example.com/callback";

    #[tokio::test]
    async fn code_exchange_posts_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_secret=secret"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = exchange_code(
            &Client::new(),
            &google(),
            &format!("{}/token", server.uri()),
            "auth-code",
            REDIRECT,
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token, "access-token");
        assert!(tokens.id_token.is_none());
    }

    #[tokio::test]
    async fn public_client_sends_no_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token"
            })))
            .mount(&server)
            .await;

        let mut provider = google();
        provider.client_auth = ClientAuth::Public;
        exchange_code(
            &Client::new(),
            &provider,
            &format!("{}/token", server.uri()),
            "auth-code",
            REDIRECT,
        )
        .await
        .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(!body.contains("client_secret"));
    }

    #[tokio::test]
    async fn provider_error_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Code expired"
            })))
            .mount(&server)
            .await;

        let err = exchange_code(
            &Client::new(),
            &google(),
            &format!("{}/token", server.uri()),
            "stale",
            REDIRECT,
        )
        .await
        .unwrap_err();
        match err {
            AuthError::Upstream { error, description } => {
                assert_eq!(error, "invalid_grant");
                assert_eq!(description, "Code expired");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn github_profile_is_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "login": "octo",
                "name": "Octo Cat",
                "email": "Octo@Example.com",
                "avatar_url": "https://avatars.example.com/42"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let raw = fetch_profile(&Client::new(), &format!("{}/user", server.uri()), "access-token")
            .await
            .unwrap();
        let profile = normalize_profile(&github(), None, raw).unwrap();
        assert_eq!(profile.subject, "42");
        assert_eq!(profile.nickname.as_deref(), Some("octo"));
        assert_eq!(profile.email.as_deref(), Some("Octo@Example.com"));
        assert_eq!(profile.picture.as_deref(), Some("https://avatars.example.com/42"));
        assert_eq!(profile.email_verified, None);
    }

    #[test]
    fn nested_facebook_picture() {
        let profile = normalize_profile(
            &github(),
            None,
            json!({"id": "10", "picture": {"data": {"url": "https://fb.example/p.jpg"}}}),
        )
        .unwrap();
        assert_eq!(profile.picture.as_deref(), Some("https://fb.example/p.jpg"));
    }

    #[test]
    fn missing_subject_is_upstream_error() {
        let err = normalize_profile(&github(), None, json!({"login": "octo"})).unwrap_err();
        assert!(matches!(err, AuthError::Upstream { .. }));
    }
}

//! OpenID Connect legs: discovery and provider ID token validation.

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::oauth2::{fetch_profile, normalize_profile, provider_error, ProviderTokens};
use super::providers::SocialProvider;
use super::SocialProfile;
use crate::auth::jwks_cache::JwksCache;
use crate::auth::AuthError;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
}

pub async fn discover(client: &Client, issuer: &str) -> Result<ProviderMetadata, AuthError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let res = client.get(&url).send().await?;
    if !res.status().is_success() {
        return Err(provider_error("discovery document", res).await);
    }
    res.json::<ProviderMetadata>()
        .await
        .map_err(|e| AuthError::upstream("server_error", format!("Invalid discovery document: {}", e)))
}

fn rejected(reason: impl std::fmt::Display) -> AuthError {
    AuthError::upstream("invalid_request", format!("Provider id_token rejected: {}", reason))
}

/// Checks signature, issuer, audience and lifetime of a provider ID token.
/// A `kid` missing from the cached key set forces one refetch.
pub async fn verify_id_token(
    client: &Client,
    jwks_cache: &JwksCache,
    provider: &SocialProvider,
    metadata: &ProviderMetadata,
    id_token: &str,
) -> Result<Value, AuthError> {
    let header = decode_header(id_token).map_err(rejected)?;
    let Some(kid) = header.kid.as_deref() else {
        return Err(rejected("no kid in header"));
    };
    let jwks_uri = provider.jwks_uri.as_deref().unwrap_or(&metadata.jwks_uri);

    let mut keys = jwks_cache.get(client, jwks_uri).await?;
    if keys.find(kid).is_none() {
        debug!(strategy = %provider.strategy, kid, "Refetching provider keys");
        jwks_cache.invalidate(jwks_uri);
        keys = jwks_cache.get(client, jwks_uri).await?;
    }
    let jwk = keys
        .find(kid)
        .ok_or_else(|| rejected(format!("unknown kid {}", kid)))?;
    let key = DecodingKey::from_jwk(jwk).map_err(rejected)?;

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[metadata.issuer.as_str()]);
    validation.set_audience(&[provider.client_id.as_str()]);
    validation.validate_nbf = true;

    Ok(decode::<Value>(id_token, &key, &validation)
        .map_err(rejected)?
        .claims)
}

/// Profile for an OIDC login: verified ID token claims, topped up from
/// userinfo when the provider has one. The subject always comes from the
/// ID token.
pub async fn profile_from_tokens(
    client: &Client,
    jwks_cache: &JwksCache,
    provider: &SocialProvider,
    metadata: &ProviderMetadata,
    tokens: &ProviderTokens,
) -> Result<SocialProfile, AuthError> {
    let Some(id_token) = tokens.id_token.as_deref() else {
        return Err(AuthError::upstream(
            "invalid_request",
            "Provider returned no id_token",
        ));
    };
    let mut claims = verify_id_token(client, jwks_cache, provider, metadata, id_token).await?;

    let userinfo = provider
        .userinfo_endpoint
        .as_deref()
        .or(metadata.userinfo_endpoint.as_deref());
    if let Some(endpoint) = userinfo {
        match fetch_profile(client, endpoint, &tokens.access_token).await {
            Ok(Value::Object(extra)) => {
                if let Value::Object(claims) = &mut claims {
                    for (key, value) in extra {
                        if key != provider.subject_claim {
                            claims.entry(key).or_insert(value);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(strategy = %provider.strategy, error = %e, "Userinfo unavailable"),
        }
    }

    normalize_profile(provider, Some(metadata.issuer.clone()), claims)
}

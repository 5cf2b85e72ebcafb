//! Social provider catalog.
//!
//! A provider is keyed by the strategy name that social connections carry
//! (`google-oauth2`, `github`, ...). Well-known strategies come with their
//! endpoints preset, so deployments only supply client credentials:
//!
//! ```json
//! [{"strategy": "google-oauth2", "client_id": "...", "client_secret": "..."},
//!  {"strategy": "corp-sso", "protocol": "oidc", "client_id": "...",
//!   "client_auth": "none", "issuer": "https://sso.corp.example"}]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::auth::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Discovery, ID token validation, optional userinfo.
    Oidc,
    /// Code exchange followed by a profile fetch.
    OAuth2,
}

/// Client authentication at the provider's token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    #[default]
    ClientSecretPost,
    #[serde(rename = "none")]
    Public,
}

/// One entry of `PORTCULLIS_SOCIAL_PROVIDERS_JSON`. Anything left out is
/// taken from the strategy preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub strategy: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_auth: ClientAuth,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub subject_claim: Option<String>,
}

/// A resolved provider, ready for the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SocialProvider {
    pub strategy: String,
    pub protocol: Protocol,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub client_auth: ClientAuth,
    pub scopes: Vec<String>,
    pub issuer: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub subject_claim: String,
}

struct Preset {
    protocol: Protocol,
    scopes: &'static [&'static str],
    issuer: Option<&'static str>,
    authorization_endpoint: Option<&'static str>,
    token_endpoint: Option<&'static str>,
    userinfo_endpoint: Option<&'static str>,
    subject_claim: &'static str,
}

fn preset(strategy: &str) -> Option<Preset> {
    let preset = match strategy {
        "google-oauth2" => Preset {
            protocol: Protocol::Oidc,
            scopes: &["openid", "email", "profile"],
            issuer: Some("https://accounts.google.com"),
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            subject_claim: "sub",
        },
        "linkedin" => Preset {
            protocol: Protocol::Oidc,
            scopes: &["openid", "email", "profile"],
            issuer: Some("https://www.linkedin.com/oauth"),
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            subject_claim: "sub",
        },
        "github" => Preset {
            protocol: Protocol::OAuth2,
            scopes: &["read:user", "user:email"],
            issuer: None,
            authorization_endpoint: Some("https://github.com/login/oauth/authorize"),
            token_endpoint: Some("https://github.com/login/oauth/access_token"),
            userinfo_endpoint: Some("https://api.github.com/user"),
            subject_claim: "id",
        },
        "facebook" => Preset {
            protocol: Protocol::OAuth2,
            scopes: &["email", "public_profile"],
            issuer: None,
            authorization_endpoint: Some("https://www.facebook.com/v19.0/dialog/oauth"),
            token_endpoint: Some("https://graph.facebook.com/v19.0/oauth/access_token"),
            userinfo_endpoint: Some(
                "https://graph.facebook.com/me?fields=id,name,email,picture",
            ),
            subject_claim: "id",
        },
        _ => return None,
    };
    Some(preset)
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl SocialProvider {
    /// Merges `settings` over the strategy preset and validates the result.
    pub fn from_settings(settings: ProviderSettings) -> Result<Self, AuthError> {
        let strategy = settings.strategy.trim().to_string();
        let name = strategy.clone();
        let invalid = |reason: &str| {
            Err(AuthError::Validation(format!(
                "social provider '{}': {}",
                name, reason
            )))
        };
        if strategy.is_empty() {
            return invalid("strategy cannot be empty");
        }
        if settings.client_id.trim().is_empty() {
            return invalid("client_id cannot be empty");
        }

        let preset = preset(&strategy);
        let Some(protocol) = settings.protocol.or(preset.as_ref().map(|p| p.protocol)) else {
            return invalid("unknown strategy needs an explicit protocol");
        };
        let from_preset = |value: Option<String>, pick: fn(&Preset) -> Option<&'static str>| {
            value.or_else(|| preset.as_ref().and_then(pick).map(str::to_string))
        };

        let provider = SocialProvider {
            protocol,
            client_id: settings.client_id,
            client_secret: settings.client_secret,
            client_auth: settings.client_auth,
            scopes: settings.scopes.unwrap_or_else(|| {
                preset
                    .as_ref()
                    .map(|p| p.scopes.iter().map(|s| s.to_string()).collect())
                    .unwrap_or_default()
            }),
            issuer: from_preset(settings.issuer, |p| p.issuer),
            authorization_endpoint: from_preset(settings.authorization_endpoint, |p| {
                p.authorization_endpoint
            }),
            token_endpoint: from_preset(settings.token_endpoint, |p| p.token_endpoint),
            userinfo_endpoint: from_preset(settings.userinfo_endpoint, |p| p.userinfo_endpoint),
            jwks_uri: settings.jwks_uri,
            subject_claim: settings
                .subject_claim
                .or_else(|| preset.as_ref().map(|p| p.subject_claim.to_string()))
                .unwrap_or_else(|| "sub".to_string()),
            strategy,
        };

        if provider.client_auth == ClientAuth::ClientSecretPost && !present(&provider.client_secret) {
            return invalid("client_secret is required unless client_auth is \"none\"");
        }
        if provider.scopes.is_empty() {
            return invalid("scopes cannot be empty");
        }
        match provider.protocol {
            Protocol::Oidc => {
                if !present(&provider.issuer) {
                    return invalid("oidc providers need an issuer");
                }
                if !provider.scopes.iter().any(|s| s == "openid") {
                    return invalid("oidc scopes must include openid");
                }
            }
            Protocol::OAuth2 => {
                if !present(&provider.authorization_endpoint)
                    || !present(&provider.token_endpoint)
                    || !present(&provider.userinfo_endpoint)
                {
                    return invalid("oauth2 providers need authorization, token and userinfo endpoints");
                }
            }
        }
        Ok(provider)
    }

    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// The secret to send in the token request body, if any.
    pub fn token_request_secret(&self) -> Option<&str> {
        match self.client_auth {
            ClientAuth::ClientSecretPost => self.client_secret.as_deref(),
            ClientAuth::Public => None,
        }
    }
}

/// Configured providers by strategy.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    providers: BTreeMap<String, SocialProvider>,
}

impl ProviderCatalog {
    pub fn new(settings: Vec<ProviderSettings>) -> Result<Self, AuthError> {
        let mut providers = BTreeMap::new();
        for entry in settings {
            let provider = SocialProvider::from_settings(entry)?;
            if providers.contains_key(&provider.strategy) {
                return Err(AuthError::Validation(format!(
                    "social provider '{}' is configured twice",
                    provider.strategy
                )));
            }
            providers.insert(provider.strategy.clone(), provider);
        }
        Ok(Self { providers })
    }

    pub fn get(&self, strategy: &str) -> Option<&SocialProvider> {
        self.providers.get(strategy)
    }

    pub fn strategies(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

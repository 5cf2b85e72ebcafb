//! Domain records shared by the storage layer and the authentication core.
//!
//! Every record is tenant-scoped. Users are keyed by `(tenant_id, id)` where
//! `id` carries the provider prefix (`auth2|…`, `email|…`, `google-oauth2|…`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Connection name used for username/password accounts.
pub const DATABASE_CONNECTION: &str = "Username-Password-Authentication";
/// Provider prefix for username/password accounts.
pub const DATABASE_PROVIDER: &str = "auth2";
/// Connection name and provider prefix for passwordless accounts.
pub const EMAIL_CONNECTION: &str = "email";
pub const EMAIL_PROVIDER: &str = "email";

/// Lifetime of login tickets and one-time codes.
pub const TICKET_TTL_MINUTES: i64 = 30;
/// Lifetime of authorization codes.
pub const AUTHORIZATION_CODE_TTL_MINUTES: i64 = 10;
/// Lifetime of universal-login sessions.
pub const LOGIN_SESSION_TTL_HOURS: i64 = 24;

/// Lower-cases and trims an email address. Every stored and compared email
/// goes through this.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Audience for access tokens; falls back to the server default.
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    /// The OAuth `client_id`.
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub callbacks: Vec<String>,
    #[serde(default)]
    pub allowed_logout_urls: Vec<String>,
    #[serde(default)]
    pub web_origins: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Application {
    pub fn allows_callback(&self, redirect_uri: &str) -> bool {
        self.callbacks.iter().any(|c| c == redirect_uri)
    }

    pub fn allows_logout_url(&self, url: &str) -> bool {
        self.allowed_logout_urls.iter().any(|u| u == url)
    }

    /// An origin is allowed when listed in `web_origins` or when it is the
    /// origin of one of the registered callbacks.
    pub fn allows_origin(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        if self
            .web_origins
            .iter()
            .any(|o| o.trim_end_matches('/') == origin)
        {
            return true;
        }
        self.callbacks.iter().any(|cb| {
            url::Url::parse(cb)
                .map(|u| u.origin().ascii_serialization() == origin)
                .unwrap_or(false)
        })
    }
}

/// Credential type backing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStrategy {
    /// Username/password accounts (`auth0` strategy).
    Database,
    /// Email one-time codes and magic links.
    Passwordless,
    /// Federated login through the named social provider.
    Social(String),
}

impl ConnectionStrategy {
    pub fn parse(value: &str) -> Self {
        match value {
            "auth0" | "database" => ConnectionStrategy::Database,
            "email" | "passwordless" => ConnectionStrategy::Passwordless,
            other => ConnectionStrategy::Social(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ConnectionStrategy::Database => "auth0",
            ConnectionStrategy::Passwordless => "email",
            ConnectionStrategy::Social(provider) => provider.as_str(),
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionStrategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConnectionStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ConnectionStrategy::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub strategy: ConnectionStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Provider-prefixed id, e.g. `email|01J…`.
    pub id: String,
    pub tenant_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub picture: Option<String>,
    pub locale: Option<String>,
    pub connection: String,
    pub provider: String,
    pub is_social: bool,
    /// Set on secondary identities; names the primary user.
    pub linked_to: Option<String>,
    #[serde(skip)]
    pub password_hash: Option<String>,
    /// Profile snapshot exposed on the identity list of the primary user.
    pub profile_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    /// A fresh user with a newly generated id under `provider`.
    pub fn new(tenant_id: &str, provider: &str, connection: &str, is_social: bool) -> Self {
        let local_id = uuid::Uuid::now_v7().simple().to_string();
        Self::with_id(
            tenant_id,
            &format!("{}|{}", provider, local_id),
            provider,
            connection,
            is_social,
        )
    }

    pub fn with_id(
        tenant_id: &str,
        id: &str,
        provider: &str,
        connection: &str,
        is_social: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            email: None,
            email_verified: false,
            name: None,
            nickname: None,
            picture: None,
            locale: None,
            connection: connection.to_string(),
            provider: provider.to_string(),
            is_social,
            linked_to: None,
            password_hash: None,
            profile_data: None,
            created_at: now,
            updated_at: now,
            last_login: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.linked_to.is_none()
    }

    /// The id without its provider prefix.
    pub fn local_id(&self) -> &str {
        self.id
            .split_once('|')
            .map(|(_, local)| local)
            .unwrap_or(&self.id)
    }

    /// Profile snapshot used for this user when it appears as a secondary
    /// identity.
    pub fn profile_snapshot(&self) -> Value {
        if let Some(profile) = &self.profile_data {
            return profile.clone();
        }
        let mut profile = serde_json::Map::new();
        if let Some(email) = &self.email {
            profile.insert("email".into(), Value::String(email.clone()));
            profile.insert("email_verified".into(), Value::Bool(self.email_verified));
        }
        for (key, value) in [
            ("name", &self.name),
            ("nickname", &self.nickname),
            ("picture", &self.picture),
            ("locale", &self.locale),
        ] {
            if let Some(v) = value {
                profile.insert(key.into(), Value::String(v.clone()));
            }
        }
        Value::Object(profile)
    }
}

/// Read projection of a user row as presented in a primary user's identity
/// list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub connection: String,
    pub provider: String,
    pub user_id: String,
    #[serde(rename = "isSocial")]
    pub is_social: bool,
    #[serde(rename = "profileData", skip_serializing_if = "Option::is_none")]
    pub profile_data: Option<Value>,
}

/// The parameters of the authorization request that started a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthParams {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_locales: Option<String>,
}

impl AuthParams {
    /// Space-separated scope values.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.as_deref().unwrap_or("").split_whitespace()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }
}

/// Single-use artifact bridging credential verification and token issuance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub email: String,
    pub user_id: String,
    pub auth_params: AuthParams,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OtpDelivery {
    #[default]
    Code,
    Link,
}

impl OtpDelivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpDelivery::Code => "code",
            OtpDelivery::Link => "link",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "code" => Some(OtpDelivery::Code),
            "link" => Some(OtpDelivery::Link),
            _ => None,
        }
    }
}

/// One-time code or magic-link code sent by email.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtpCode {
    pub id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub email: String,
    pub code: String,
    pub send: OtpDelivery,
    pub auth_params: AuthParams,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Browser-bound SSO session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub user_id: String,
    /// Keyed hash of the cookie token. The token itself is never stored.
    #[serde(skip)]
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_none() && self.expires_at > now
    }
}

/// Server-side state of an interactive (universal) login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginSession {
    pub id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub auth_params: AuthParams,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LoginSession {
    pub fn new(tenant_id: &str, auth_params: AuthParams) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: tenant_id.to_string(),
            client_id: auth_params.client_id.clone(),
            auth_params,
            created_at: now,
            expires_at: now + Duration::hours(LOGIN_SESSION_TTL_HOURS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationCode {
    pub code: String,
    pub tenant_id: String,
    pub client_id: String,
    pub user_id: String,
    pub auth_params: AuthParams,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshToken {
    pub id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub audience: String,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Signing key pair. The newest non-revoked certificate signs new tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SigningCertificate {
    pub kid: String,
    /// PKCS#8 PEM encoded public key.
    pub public_key: String,
    /// PKCS#8 PEM encoded private key.
    #[serde(skip)]
    pub private_key: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

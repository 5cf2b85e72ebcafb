//! Authentication core.
//!
//! This module implements the identity-provider flows:
//! - Credential verification (password, email one-time code) and login tickets
//! - Identity resolution across linked accounts
//! - ES256 token minting with rotating signing keys
//! - SSO sessions backing silent authentication
//! - Federated social login (OIDC and plain OAuth2 providers)
//! - The `/authorize` decision state machine and the token grants

pub mod authorize;
pub mod credentials;
pub mod email;
pub mod grants;
pub mod identity;
pub mod jwks_cache;
pub mod keys;
pub mod passwordless;
pub mod password;
pub mod pkce;
pub mod session;
pub mod signup;
pub mod social;
pub mod ticket;
pub mod tokens;

use axum::http::StatusCode;
use thiserror::Error;

use crate::store::StoreError;

pub use authorize::{
    AuthResponse, AuthorizeOutcome, AuthorizeRequest, Authorizer, Completion, ResponseMode,
    ResponseType,
};
pub use credentials::{Credential, CredentialVerifier, Verified};
pub use email::{EmailKind, EmailMessage, EmailSender, LogEmailSender, MemoryEmailSender};
pub use grants::{TokenGrants, TokenRequest};
pub use identity::{IdentityResolver, ResolvedUser};
pub use keys::KeyManager;
pub use passwordless::PasswordlessService;
pub use session::SessionManager;
pub use signup::SignupService;
pub use social::{SocialLoginAdapter, SocialProfile};
pub use ticket::{IssuedTicket, TicketExchange};
pub use tokens::{TokenMinter, TokenSet, TOKEN_LIFETIME_SECS};

/// Public description for failed password logins.
pub const WRONG_PASSWORD: &str = "Wrong email or password.";
/// Public description for failed one-time-code logins.
pub const WRONG_CODE: &str = "Wrong email or verification code.";

/// Authentication-related errors.
///
/// `Authentication` carries only the public, uninformative message; details
/// are logged where the failure is detected.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("Login required")]
    LoginRequired,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidGrant(String),

    #[error("{0}")]
    InvalidClient(String),

    #[error("Upstream provider error: {error}: {description}")]
    Upstream { error: String, description: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("JWT validation failed: {0}")]
    Jwt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn upstream(error: impl Into<String>, description: impl Into<String>) -> Self {
        AuthError::Upstream {
            error: error.into(),
            description: description.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::Authentication(_) => StatusCode::FORBIDDEN,
            AuthError::Authorization(_) => StatusCode::FORBIDDEN,
            AuthError::LoginRequired => StatusCode::UNAUTHORIZED,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::InvalidGrant(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            AuthError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AuthError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AuthError::Database(_) | AuthError::Crypto(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// OAuth-style error code.
    pub fn code(&self) -> &str {
        match self {
            AuthError::Validation(_) => "invalid_request",
            AuthError::Authentication(_) => "access_denied",
            AuthError::Authorization(_) => "unauthorized",
            AuthError::LoginRequired => "login_required",
            AuthError::NotFound(_) => "not_found",
            AuthError::Conflict(_) => "conflict",
            AuthError::InvalidGrant(_) => "invalid_grant",
            AuthError::InvalidClient(_) => "invalid_client",
            AuthError::Upstream { error, .. } => error.as_str(),
            AuthError::Jwt(_) => "invalid_token",
            AuthError::Database(_) | AuthError::Crypto(_) | AuthError::Internal(_) => {
                "server_error"
            }
        }
    }

    /// Description safe to return to callers. Internal failures are not
    /// described.
    pub fn public_description(&self) -> String {
        match self {
            AuthError::Upstream { description, .. } => description.clone(),
            AuthError::Jwt(_) => "Invalid token".to_string(),
            AuthError::Database(_) | AuthError::Crypto(_) | AuthError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(msg) => AuthError::Conflict(msg),
            other => AuthError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::upstream("temporarily_unavailable", "Identity provider timed out")
        } else {
            AuthError::upstream("server_error", err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::Jwt(err.to_string())
    }
}

/// Random URL-safe token with `bytes` bytes of entropy.
pub(crate) fn random_token(bytes: usize) -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

//! Username-password signup and email verification.
//!
//! Signing up again with an existing address succeeds and replaces the
//! stored password hash. Verifying an address links the password account
//! under an existing verified account with the same email, if there is one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::email::{EmailKind, EmailMessage, EmailSender};
use super::identity::IdentityResolver;
use super::password::hash_password;
use super::tokens::{mint, TokenMinter};
use super::AuthError;
use crate::model::{
    normalize_email, Application, ConnectionStrategy, User, DATABASE_CONNECTION,
    DATABASE_PROVIDER,
};
use crate::store::Storage;

/// Lifetime of an email verification link.
pub const VERIFY_EMAIL_TTL_SECS: i64 = 86_400;

/// Response body of `/dbconnections/signup`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignupResult {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    pub email_verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct VerifyEmailClaims {
    iss: String,
    aud: String,
    sub: String,
    tenant_id: String,
    iat: i64,
    exp: i64,
}

pub struct SignupService {
    store: Arc<dyn Storage>,
    email: Arc<dyn EmailSender>,
    minter: Arc<TokenMinter>,
    identity: IdentityResolver,
}

impl SignupService {
    pub fn new(
        store: Arc<dyn Storage>,
        email: Arc<dyn EmailSender>,
        minter: Arc<TokenMinter>,
        identity: IdentityResolver,
    ) -> Self {
        Self {
            store,
            email,
            minter,
            identity,
        }
    }

    fn verify_audience(&self) -> String {
        format!("{}u/verify-email", self.minter.issuer())
    }

    async fn require_database_connection(
        &self,
        tenant_id: &str,
        connection: &str,
    ) -> Result<(), AuthError> {
        if connection == DATABASE_CONNECTION {
            return Ok(());
        }
        match self.store.get_connection(tenant_id, connection).await? {
            Some(c) if c.strategy == ConnectionStrategy::Database => Ok(()),
            _ => Err(AuthError::Validation(format!(
                "Unknown database connection: {}",
                connection
            ))),
        }
    }

    #[instrument(skip(self, application, email, password), fields(tenant_id = %application.tenant_id, client_id = %application.id))]
    pub async fn signup(
        &self,
        application: &Application,
        email: &str,
        password: &str,
        connection: &str,
    ) -> Result<SignupResult, AuthError> {
        let tenant_id = application.tenant_id.as_str();
        self.require_database_connection(tenant_id, connection)
            .await?;

        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::Validation("Invalid email address".to_string()));
        }
        if password.is_empty() {
            return Err(AuthError::Validation("Password is required".to_string()));
        }
        let password_hash = hash_password(password)?;

        if let Some(existing) = self
            .store
            .find_user_by_email_and_provider(tenant_id, &email, DATABASE_PROVIDER)
            .await?
        {
            self.store
                .set_password_hash(tenant_id, &existing.id, &password_hash)
                .await?;
            warn!(user_id = %existing.id, "Signup for existing account replaced its password");
            return Ok(SignupResult {
                id: existing.local_id().to_string(),
                email,
                email_verified: existing.email_verified,
            });
        }

        let mut user = User::new(tenant_id, DATABASE_PROVIDER, DATABASE_CONNECTION, false);
        user.email = Some(email.clone());
        user.password_hash = Some(password_hash);
        self.store.insert_user(&user).await?;
        info!(user_id = %user.id, "Created password user");

        let link = self.verification_link(&user).await?;
        self.email
            .send(EmailMessage {
                tenant_id: tenant_id.to_string(),
                to: email.clone(),
                kind: EmailKind::VerifyEmail { link },
            })
            .await?;

        Ok(SignupResult {
            id: user.local_id().to_string(),
            email,
            email_verified: false,
        })
    }

    async fn verification_link(&self, user: &User) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = VerifyEmailClaims {
            iss: self.minter.issuer().to_string(),
            aud: self.verify_audience(),
            sub: user.id.clone(),
            tenant_id: user.tenant_id.clone(),
            iat: now,
            exp: now + VERIFY_EMAIL_TTL_SECS,
        };
        let cert = self.minter.keys().active().await?;
        let token = mint(&claims, &cert)?;
        Ok(format!(
            "{}?ticket={}",
            self.verify_audience(),
            urlencoding::encode(&token)
        ))
    }

    /// Completes a verification link.
    pub async fn verify_email_ticket(&self, ticket: &str) -> Result<User, AuthError> {
        let claims: VerifyEmailClaims = self
            .minter
            .verify(ticket, Some(&self.verify_audience()))
            .await
            .map_err(|_| AuthError::Validation("Invalid or expired verification link".to_string()))?;
        self.verify_email(&claims.tenant_id, &claims.sub).await
    }

    /// Marks a password user verified and links it under an existing
    /// verified primary with the same email.
    #[instrument(skip(self))]
    pub async fn verify_email(&self, tenant_id: &str, user_id: &str) -> Result<User, AuthError> {
        let mut user = self
            .store
            .get_user(tenant_id, user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("User not found: {}", user_id)))?;
        if user.email_verified {
            return Ok(user);
        }

        self.store.set_email_verified(tenant_id, user_id).await?;
        user.email_verified = true;
        info!("Email verified");

        let Some(email) = user.email.clone() else {
            return Ok(user);
        };
        let primary = self
            .store
            .find_users_by_email(tenant_id, &email)
            .await?
            .into_iter()
            .find(|other| other.id != user.id && other.is_primary() && other.email_verified);

        if let Some(primary) = primary {
            match self.identity.link(tenant_id, &primary.id, &user.id).await {
                Ok(()) => {
                    info!(primary_id = %primary.id, "Linked verified account to existing user");
                    user.linked_to = Some(primary.id);
                }
                Err(AuthError::Conflict(reason)) => {
                    warn!(primary_id = %primary.id, %reason, "Automatic account linking skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(user)
    }
}

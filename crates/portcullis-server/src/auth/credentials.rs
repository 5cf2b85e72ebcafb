//! Credential verification.
//!
//! Each credential variant validates itself and resolves to the user it
//! authenticates (before link resolution). Failures are deliberately
//! uniform: a missing user, an unknown realm and a wrong secret all produce
//! the same public error.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::password::{verify_against_dummy, verify_password};
use super::{AuthError, WRONG_CODE, WRONG_PASSWORD};
use crate::model::{
    normalize_email, AuthParams, ConnectionStrategy, User, DATABASE_CONNECTION,
    DATABASE_PROVIDER, EMAIL_CONNECTION, EMAIL_PROVIDER,
};
use crate::store::Storage;

const PASSWORD_REALM_GRANT: &str = "http://auth0.com/oauth/grant-type/password-realm";
const PASSWORDLESS_OTP_GRANT: &str = "http://auth0.com/oauth/grant-type/passwordless/otp";

#[derive(Clone, PartialEq)]
pub enum Credential {
    Password {
        username: String,
        realm: String,
        password: String,
    },
    Otp {
        username: String,
        otp: String,
    },
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password { username, realm, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("realm", realm)
                .finish_non_exhaustive(),
            Credential::Otp { username, .. } => f
                .debug_struct("Otp")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, AuthError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AuthError::Validation(format!("Missing required parameter: {}", field)))
}

impl Credential {
    /// Builds a credential from the `credential_type` dispatch of
    /// `/co/authenticate` (short names or grant-type URIs).
    pub fn from_request(
        credential_type: &str,
        username: Option<String>,
        realm: Option<String>,
        password: Option<String>,
        otp: Option<String>,
    ) -> Result<Self, AuthError> {
        match credential_type {
            "password" | PASSWORD_REALM_GRANT => Ok(Credential::Password {
                username: required(username, "username")?,
                realm: realm.unwrap_or_else(|| DATABASE_CONNECTION.to_string()),
                password: required(password, "password")?,
            }),
            "otp" | PASSWORDLESS_OTP_GRANT => {
                if let Some(realm) = realm.as_deref() {
                    if realm != EMAIL_CONNECTION {
                        return Err(AuthError::Validation(format!(
                            "Unsupported realm for otp: {}",
                            realm
                        )));
                    }
                }
                Ok(Credential::Otp {
                    username: required(username, "username")?,
                    otp: required(otp, "otp")?,
                })
            }
            other => Err(AuthError::Validation(format!(
                "Unsupported credential_type: {}",
                other
            ))),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Credential::Password { username, .. } | Credential::Otp { username, .. } => username,
        }
    }
}

/// A verified credential.
#[derive(Debug, Clone)]
pub struct Verified {
    pub user: User,
    /// Parameters of the flow that sent the one-time code, if any.
    pub auth_params: Option<AuthParams>,
}

pub struct CredentialVerifier {
    store: Arc<dyn Storage>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, credential))]
    pub async fn verify(
        &self,
        tenant_id: &str,
        credential: &Credential,
    ) -> Result<Verified, AuthError> {
        match credential {
            Credential::Password {
                username,
                realm,
                password,
            } => self
                .verify_password(tenant_id, username, realm, password)
                .await
                .map(|user| Verified {
                    user,
                    auth_params: None,
                }),
            Credential::Otp { username, otp } => self.verify_otp(tenant_id, username, otp).await,
        }
    }

    async fn is_database_realm(&self, tenant_id: &str, realm: &str) -> Result<bool, AuthError> {
        if realm == DATABASE_CONNECTION {
            return Ok(true);
        }
        Ok(matches!(
            self.store.get_connection(tenant_id, realm).await?,
            Some(c) if c.strategy == ConnectionStrategy::Database
        ))
    }

    async fn verify_password(
        &self,
        tenant_id: &str,
        username: &str,
        realm: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let fail = || AuthError::Authentication(WRONG_PASSWORD.to_string());

        if !self.is_database_realm(tenant_id, realm).await? {
            debug!(realm, "Password login against a non-database realm");
            verify_against_dummy(password);
            return Err(fail());
        }

        let email = normalize_email(username);
        let user = self
            .store
            .find_user_by_email_and_provider(tenant_id, &email, DATABASE_PROVIDER)
            .await?;

        match user {
            Some(user) => {
                let matches = user
                    .password_hash
                    .as_deref()
                    .map(|hash| verify_password(password, hash))
                    .unwrap_or_else(|| {
                        verify_against_dummy(password);
                        false
                    });
                if matches {
                    Ok(user)
                } else {
                    debug!(user_id = %user.id, "Password mismatch");
                    Err(fail())
                }
            }
            None => {
                verify_against_dummy(password);
                debug!("Password login for unknown user");
                Err(fail())
            }
        }
    }

    /// One-time codes are matched exactly and stay reusable until they
    /// expire; single use is enforced by the ticket they are exchanged for.
    async fn verify_otp(
        &self,
        tenant_id: &str,
        username: &str,
        code: &str,
    ) -> Result<Verified, AuthError> {
        let email = normalize_email(username);
        let now = Utc::now();

        let otp = self
            .store
            .find_active_otps(tenant_id, &email, now)
            .await?
            .into_iter()
            .find(|otp| otp.code == code)
            .ok_or_else(|| {
                debug!("No matching one-time code");
                AuthError::Authentication(WRONG_CODE.to_string())
            })?;
        self.store.mark_otp_used(&otp.id, now).await?;

        let user = match self
            .store
            .find_user_by_email_and_provider(tenant_id, &email, EMAIL_PROVIDER)
            .await?
        {
            Some(user) if user.email_verified => user,
            Some(mut user) => {
                self.store.set_email_verified(tenant_id, &user.id).await?;
                user.email_verified = true;
                user
            }
            None => {
                let mut user = User::new(tenant_id, EMAIL_PROVIDER, EMAIL_CONNECTION, false);
                user.email = Some(email);
                user.email_verified = true;
                self.store.insert_user(&user).await?;
                info!(user_id = %user.id, "Created passwordless user");
                user
            }
        };

        Ok(Verified {
            user,
            auth_params: Some(otp.auth_params),
        })
    }
}

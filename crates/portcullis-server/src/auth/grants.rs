//! `/oauth/token` grant dispatch.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::credentials::{Credential, CredentialVerifier};
use super::identity::IdentityResolver;
use super::pkce::{self, ChallengeMethod};
use super::tokens::{resolve_audience, MintRequest, TokenMinter, TokenSet};
use super::{random_token, AuthError};
use crate::model::{Application, AuthParams, RefreshToken, Tenant, User, DATABASE_CONNECTION};
use crate::store::Storage;

const OFFLINE_ACCESS: &str = "offline_access";

/// Form or JSON body of `/oauth/token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub scope: Option<String>,
    pub audience: Option<String>,
    pub refresh_token: Option<String>,
}

impl TokenRequest {
    /// Applies HTTP Basic client credentials; they win over body fields.
    pub fn with_basic_auth(mut self, client_id: String, client_secret: String) -> Self {
        self.client_id = Some(client_id);
        self.client_secret = Some(client_secret);
        self
    }
}

fn invalid_grant(message: &str) -> AuthError {
    AuthError::InvalidGrant(message.to_string())
}

pub struct TokenGrants {
    store: Arc<dyn Storage>,
    verifier: CredentialVerifier,
    identity: Arc<IdentityResolver>,
    minter: Arc<TokenMinter>,
}

impl TokenGrants {
    pub fn new(
        store: Arc<dyn Storage>,
        identity: Arc<IdentityResolver>,
        minter: Arc<TokenMinter>,
    ) -> Self {
        Self {
            verifier: CredentialVerifier::new(store.clone()),
            store,
            identity,
            minter,
        }
    }

    #[instrument(skip_all, fields(grant_type = %request.grant_type, client_id = request.client_id.as_deref().unwrap_or_default()))]
    pub async fn handle(&self, request: TokenRequest) -> Result<TokenSet, AuthError> {
        let (application, tenant) = self.authenticate_client(&request).await?;

        let tokens = match request.grant_type.as_str() {
            "authorization_code" => {
                self.authorization_code(&application, &tenant, &request)
                    .await?
            }
            "password" | "http://auth0.com/oauth/grant-type/password-realm" => {
                self.password(&application, &tenant, &request).await?
            }
            "client_credentials" => {
                self.client_credentials(&application, &tenant, &request)
                    .await?
            }
            "refresh_token" => self.refresh(&application, &tenant, &request).await?,
            other => {
                return Err(AuthError::Validation(format!(
                    "Unsupported grant_type: {}",
                    other
                )))
            }
        };

        info!("Token issued");
        Ok(tokens)
    }

    /// Resolves the client. A presented secret must match.
    async fn authenticate_client(
        &self,
        request: &TokenRequest,
    ) -> Result<(Application, Tenant), AuthError> {
        let client_id = request
            .client_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                AuthError::Validation("Missing required parameter: client_id".to_string())
            })?;
        let application = self
            .store
            .get_application(client_id)
            .await?
            .ok_or_else(|| AuthError::InvalidClient("Unknown client".to_string()))?;

        if let Some(presented) = request.client_secret.as_deref() {
            if application.client_secret.as_deref() != Some(presented) {
                warn!("Client secret mismatch");
                return Err(AuthError::InvalidClient(
                    "Client authentication failed".to_string(),
                ));
            }
        }

        let tenant = self
            .store
            .get_tenant(&application.tenant_id)
            .await?
            .ok_or_else(|| {
                AuthError::NotFound(format!("Tenant not found: {}", application.tenant_id))
            })?;
        Ok((application, tenant))
    }

    fn require_client_secret(
        application: &Application,
        request: &TokenRequest,
    ) -> Result<(), AuthError> {
        match (&application.client_secret, &request.client_secret) {
            (Some(_), Some(_)) => Ok(()),
            _ => Err(AuthError::InvalidClient(
                "Client authentication required".to_string(),
            )),
        }
    }

    async fn mint_for_user(
        &self,
        application: &Application,
        tenant: &Tenant,
        user: &User,
        params: &AuthParams,
        session_id: Option<&str>,
    ) -> Result<TokenSet, AuthError> {
        let mut tokens = self
            .minter
            .issue(MintRequest {
                tenant,
                client_id: &application.id,
                user: Some(user),
                params,
                session_id,
                include_access_token: true,
                include_id_token: true,
            })
            .await?;

        if params.has_scope(OFFLINE_ACCESS) {
            let record = RefreshToken {
                id: random_token(32),
                tenant_id: tenant.id.clone(),
                client_id: application.id.clone(),
                user_id: user.id.clone(),
                scope: params.scope.clone().unwrap_or_default(),
                audience: resolve_audience(params, tenant, self.minter.default_audience()),
                session_id: session_id.map(str::to_string),
                created_at: Utc::now(),
                revoked_at: None,
            };
            self.store.insert_refresh_token(&record).await?;
            tokens.refresh_token = Some(record.id);
        }
        Ok(tokens)
    }

    async fn authorization_code(
        &self,
        application: &Application,
        tenant: &Tenant,
        request: &TokenRequest,
    ) -> Result<TokenSet, AuthError> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| AuthError::Validation("Missing required parameter: code".to_string()))?;
        let record = self
            .store
            .redeem_code(code, Utc::now())
            .await?
            .ok_or_else(|| invalid_grant("Invalid authorization code"))?;

        if record.client_id != application.id || record.tenant_id != tenant.id {
            warn!("Authorization code presented by another client");
            return Err(invalid_grant("Invalid authorization code"));
        }
        if let Some(expected) = record.auth_params.redirect_uri.as_deref() {
            if request.redirect_uri.as_deref() != Some(expected) {
                return Err(invalid_grant("redirect_uri does not match"));
            }
        }

        match record.auth_params.code_challenge.as_deref() {
            Some(challenge) => {
                let method =
                    ChallengeMethod::parse(record.auth_params.code_challenge_method.as_deref())?;
                let verifier = request
                    .code_verifier
                    .as_deref()
                    .ok_or_else(|| invalid_grant("Missing code_verifier"))?;
                if !pkce::verify(method, challenge, verifier) {
                    return Err(invalid_grant("Invalid code_verifier"));
                }
            }
            None => Self::require_client_secret(application, request)?,
        }

        let resolved = self
            .identity
            .resolve_by_id(&tenant.id, &record.user_id)
            .await?;
        self.mint_for_user(
            application,
            tenant,
            &resolved.user,
            &record.auth_params,
            record.session_id.as_deref(),
        )
        .await
    }

    async fn password(
        &self,
        application: &Application,
        tenant: &Tenant,
        request: &TokenRequest,
    ) -> Result<TokenSet, AuthError> {
        let credential = Credential::from_request(
            "password",
            request.username.clone(),
            Some(
                request
                    .realm
                    .clone()
                    .unwrap_or_else(|| DATABASE_CONNECTION.to_string()),
            ),
            request.password.clone(),
            None,
        )?;
        let verified = self.verifier.verify(&tenant.id, &credential).await?;
        let resolved = self.identity.resolve_primary(&verified.user).await?;
        self.store
            .record_login(&tenant.id, &resolved.user.id, Utc::now())
            .await?;

        let params = AuthParams {
            client_id: application.id.clone(),
            scope: request.scope.clone(),
            audience: request.audience.clone(),
            ..Default::default()
        };
        self.mint_for_user(application, tenant, &resolved.user, &params, None)
            .await
    }

    async fn client_credentials(
        &self,
        application: &Application,
        tenant: &Tenant,
        request: &TokenRequest,
    ) -> Result<TokenSet, AuthError> {
        Self::require_client_secret(application, request)?;
        let params = AuthParams {
            client_id: application.id.clone(),
            scope: request.scope.clone(),
            audience: request.audience.clone(),
            ..Default::default()
        };
        self.minter
            .issue(MintRequest {
                tenant,
                client_id: &application.id,
                user: None,
                params: &params,
                session_id: None,
                include_access_token: true,
                include_id_token: false,
            })
            .await
    }

    async fn refresh(
        &self,
        application: &Application,
        tenant: &Tenant,
        request: &TokenRequest,
    ) -> Result<TokenSet, AuthError> {
        let id = request.refresh_token.as_deref().ok_or_else(|| {
            AuthError::Validation("Missing required parameter: refresh_token".to_string())
        })?;
        let record = self
            .store
            .get_refresh_token(id)
            .await?
            .filter(|r| r.revoked_at.is_none())
            .filter(|r| r.client_id == application.id && r.tenant_id == tenant.id)
            .ok_or_else(|| invalid_grant("Invalid refresh token"))?;

        let resolved = self
            .identity
            .resolve_by_id(&tenant.id, &record.user_id)
            .await?;
        let params = AuthParams {
            client_id: application.id.clone(),
            scope: Some(record.scope.clone()),
            audience: Some(record.audience.clone()),
            ..Default::default()
        };
        let mut tokens = self
            .minter
            .issue(MintRequest {
                tenant,
                client_id: &application.id,
                user: Some(&resolved.user),
                params: &params,
                session_id: record.session_id.as_deref(),
                include_access_token: true,
                include_id_token: true,
            })
            .await?;
        tokens.refresh_token = None;
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::KeyManager;
    use crate::auth::password::hash_password;
    use crate::auth::tokens::AccessClaims;
    use crate::db::{in_memory_store, SqlStore};
    use crate::model::{AuthorizationCode, DATABASE_PROVIDER};
    use crate::store::{AuthorizationCodeStore, DirectoryStore, UserStore};
    use chrono::Duration;

    const ISSUER: &str = "https://id.example.com/";

    struct Fixture {
        store: Arc<SqlStore>,
        grants: TokenGrants,
        minter: Arc<TokenMinter>,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(in_memory_store("grants").await.unwrap());
        store
            .insert_tenant(&Tenant {
                id: "acme".to_string(),
                name: "Acme".to_string(),
                audience: Some("https://api.acme.example".to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_application(&Application {
                id: "app".to_string(),
                tenant_id: "acme".to_string(),
                name: "App".to_string(),
                client_secret: Some("shh".to_string()),
                callbacks: vec!["https://app.example.com/cb".to_string()],
                allowed_logout_urls: vec![],
                web_origins: vec![],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut user = User::new("acme", DATABASE_PROVIDER, DATABASE_CONNECTION, false);
        user.email = Some("john@example.com".to_string());
        user.password_hash = Some(hash_password("pw").unwrap());
        store.insert_user(&user).await.unwrap();

        let keys = Arc::new(KeyManager::new(
            store.clone(),
            Duration::days(30),
            Duration::seconds(600),
        ));
        keys.ensure_active().await.unwrap();
        let minter = Arc::new(TokenMinter::new(keys, ISSUER, "urn:default"));
        let grants = TokenGrants::new(
            store.clone(),
            Arc::new(IdentityResolver::new(store.clone())),
            minter.clone(),
        );
        Fixture {
            store,
            grants,
            minter,
            user,
        }
    }

    async fn store_code(f: &Fixture, params: AuthParams) -> String {
        let now = Utc::now();
        let code = AuthorizationCode {
            code: random_token(32),
            tenant_id: "acme".to_string(),
            client_id: "app".to_string(),
            user_id: f.user.id.clone(),
            auth_params: params,
            session_id: None,
            created_at: now,
            expires_at: now + Duration::minutes(10),
            used_at: None,
        };
        f.store.insert_code(&code).await.unwrap();
        code.code
    }

    #[tokio::test]
    async fn pkce_code_exchange_redeems_once() {
        let f = fixture().await;
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let code = store_code(
            &f,
            AuthParams {
                client_id: "app".to_string(),
                scope: Some("openid offline_access".to_string()),
                code_challenge: Some(pkce::s256_challenge(verifier)),
                code_challenge_method: Some("S256".to_string()),
                ..Default::default()
            },
        )
        .await;

        let request = TokenRequest {
            grant_type: "authorization_code".to_string(),
            client_id: Some("app".to_string()),
            code: Some(code),
            code_verifier: Some(verifier.to_string()),
            ..Default::default()
        };
        let tokens = f.grants.handle(request.clone()).await.unwrap();
        assert!(tokens.id_token.is_some());
        assert!(tokens.refresh_token.is_some());

        let access: AccessClaims = f.minter.verify(&tokens.access_token, None).await.unwrap();
        assert_eq!(access.aud, "https://api.acme.example");

        let err = f.grants.handle(request).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn wrong_code_verifier_is_rejected() {
        let f = fixture().await;
        let code = store_code(
            &f,
            AuthParams {
                client_id: "app".to_string(),
                code_challenge: Some("expected".to_string()),
                ..Default::default()
            },
        )
        .await;
        let err = f
            .grants
            .handle(TokenRequest {
                grant_type: "authorization_code".to_string(),
                client_id: Some("app".to_string()),
                code: Some(code),
                code_verifier: Some("other".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn code_exchange_requires_authorize_redirect_uri() {
        let f = fixture().await;
        let params = AuthParams {
            client_id: "app".to_string(),
            redirect_uri: Some("https://app.example.com/cb".to_string()),
            ..Default::default()
        };
        let exchange = |code: String, redirect_uri: Option<&str>| TokenRequest {
            grant_type: "authorization_code".to_string(),
            client_id: Some("app".to_string()),
            client_secret: Some("shh".to_string()),
            code: Some(code),
            redirect_uri: redirect_uri.map(str::to_string),
            ..Default::default()
        };

        let code = store_code(&f, params.clone()).await;
        let err = f.grants.handle(exchange(code, None)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));

        let code = store_code(&f, params.clone()).await;
        let err = f
            .grants
            .handle(exchange(code, Some("https://app.example.com/other")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));

        let code = store_code(&f, params).await;
        let tokens = f
            .grants
            .handle(exchange(code, Some("https://app.example.com/cb")))
            .await
            .unwrap();
        assert!(!tokens.access_token.is_empty());
    }

    #[tokio::test]
    async fn client_credentials_requires_secret() {
        let f = fixture().await;
        let err = f
            .grants
            .handle(TokenRequest {
                grant_type: "client_credentials".to_string(),
                client_id: Some("app".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidClient(_)));

        let tokens = f
            .grants
            .handle(
                TokenRequest {
                    grant_type: "client_credentials".to_string(),
                    ..Default::default()
                }
                .with_basic_auth("app".to_string(), "shh".to_string()),
            )
            .await
            .unwrap();
        assert!(tokens.id_token.is_none());
        let access: AccessClaims = f.minter.verify(&tokens.access_token, None).await.unwrap();
        assert_eq!(access.sub, "app@clients");
    }

    #[tokio::test]
    async fn password_grant_and_refresh() {
        let f = fixture().await;
        let tokens = f
            .grants
            .handle(TokenRequest {
                grant_type: "password".to_string(),
                client_id: Some("app".to_string()),
                username: Some("JOHN@example.com".to_string()),
                password: Some("pw".to_string()),
                scope: Some("openid offline_access".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let refresh = tokens.refresh_token.unwrap();

        let refreshed = f
            .grants
            .handle(TokenRequest {
                grant_type: "refresh_token".to_string(),
                client_id: Some("app".to_string()),
                refresh_token: Some(refresh),
                ..Default::default()
            })
            .await
            .unwrap();
        let access: AccessClaims = f
            .minter
            .verify(&refreshed.access_token, None)
            .await
            .unwrap();
        assert_eq!(access.sub, f.user.id);

        let err = f
            .grants
            .handle(TokenRequest {
                grant_type: "password".to_string(),
                client_id: Some("app".to_string()),
                username: Some("john@example.com".to_string()),
                password: Some("nope".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
    }

    #[tokio::test]
    async fn unknown_grant_type_is_invalid_request() {
        let f = fixture().await;
        let err = f
            .grants
            .handle(TokenRequest {
                grant_type: "device_code".to_string(),
                client_id: Some("app".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }
}

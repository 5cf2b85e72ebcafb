//! Access and ID token minting and verification.
//!
//! Tokens are ES256 JWTs with a fixed 86,400 second lifetime, signed by the
//! active certificate and verified against a JWKS snapshot by `kid`.

use chrono::Utc;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::keys::KeyManager;
use super::AuthError;
use crate::model::{AuthParams, SigningCertificate, Tenant, User};

pub const TOKEN_LIFETIME_SECS: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub scope: String,
    pub azp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl IdClaims {
    /// Adds the profile claims that the requested scopes permit.
    pub fn with_profile(mut self, user: &User, params: &AuthParams) -> Self {
        if params.has_scope("email") {
            self.email = user.email.clone();
            self.email_verified = Some(user.email_verified);
        }
        if params.has_scope("profile") {
            self.name = user.name.clone();
            self.nickname = user.nickname.clone();
            self.picture = user.picture.clone();
            self.locale = user.locale.clone();
        }
        self
    }
}

/// Result of a successful token issuance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Sign `claims` with `cert`.
pub fn mint<T: Serialize>(claims: &T, cert: &SigningCertificate) -> Result<String, AuthError> {
    let key = EncodingKey::from_ec_pem(cert.private_key.as_bytes())
        .map_err(|e| AuthError::Crypto(format!("Invalid signing key {}: {}", cert.kid, e)))?;
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(cert.kid.clone());
    Ok(encode(&header, claims, &key)?)
}

/// Verify `token` against `jwks`. The key is selected strictly by the
/// header `kid`; an unknown `kid` fails. `audience` is only checked when
/// given.
pub fn verify<T: DeserializeOwned>(
    token: &str,
    jwks: &JwkSet,
    issuer: &str,
    audience: Option<&str>,
) -> Result<T, AuthError> {
    let header = decode_header(token)?;
    let kid = header
        .kid
        .as_deref()
        .ok_or_else(|| AuthError::Jwt("token header has no kid".to_string()))?;
    let jwk = jwks
        .find(kid)
        .ok_or_else(|| AuthError::Jwt(format!("unknown kid: {}", kid)))?;
    let key = DecodingKey::from_jwk(jwk)?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[issuer]);
    match audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    Ok(decode::<T>(token, &key, &validation)?.claims)
}

/// The access-token audience: the request's, else the tenant's, else the
/// server default.
pub fn resolve_audience(params: &AuthParams, tenant: &Tenant, default: &str) -> String {
    params
        .audience
        .clone()
        .or_else(|| tenant.audience.clone())
        .unwrap_or_else(|| default.to_string())
}

/// What a token is being minted for.
pub struct MintRequest<'a> {
    pub tenant: &'a Tenant,
    pub client_id: &'a str,
    /// The canonical user. `None` for machine-to-machine tokens.
    pub user: Option<&'a User>,
    pub params: &'a AuthParams,
    pub session_id: Option<&'a str>,
    pub include_access_token: bool,
    pub include_id_token: bool,
}

pub struct TokenMinter {
    keys: Arc<KeyManager>,
    issuer: String,
    default_audience: String,
}

impl TokenMinter {
    pub fn new(keys: Arc<KeyManager>, issuer: &str, default_audience: &str) -> Self {
        Self {
            keys,
            issuer: issuer.to_string(),
            default_audience: default_audience.to_string(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn default_audience(&self) -> &str {
        &self.default_audience
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant.id, client_id = %request.client_id))]
    pub async fn issue(&self, request: MintRequest<'_>) -> Result<TokenSet, AuthError> {
        let cert = self.keys.active().await?;
        let now = Utc::now().timestamp();
        let exp = now + TOKEN_LIFETIME_SECS;

        let subject = match request.user {
            Some(user) => user.id.clone(),
            None => format!("{}@clients", request.client_id),
        };
        let scope = request.params.scope.clone().unwrap_or_default();

        let access_token = if request.include_access_token {
            let claims = AccessClaims {
                iss: self.issuer.clone(),
                sub: subject.clone(),
                aud: resolve_audience(request.params, request.tenant, &self.default_audience),
                iat: now,
                exp,
                scope: scope.clone(),
                azp: request.client_id.to_string(),
            };
            mint(&claims, &cert)?
        } else {
            String::new()
        };

        let id_token = match (request.include_id_token, request.user) {
            (true, Some(user)) if request.params.has_scope("openid") => {
                let claims = IdClaims {
                    iss: self.issuer.clone(),
                    sub: subject.clone(),
                    aud: request.client_id.to_string(),
                    iat: now,
                    exp,
                    nonce: request.params.nonce.clone(),
                    sid: request.session_id.map(str::to_string),
                    ..Default::default()
                }
                .with_profile(user, request.params);
                Some(mint(&claims, &cert)?)
            }
            _ => None,
        };

        debug!(kid = %cert.kid, "Minted tokens");
        Ok(TokenSet {
            access_token,
            id_token,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_in: TOKEN_LIFETIME_SECS,
            scope: (!scope.is_empty()).then_some(scope),
        })
    }

    /// Verify a token issued by this server against the currently published
    /// keys.
    pub async fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<T, AuthError> {
        let jwks = self.keys.jwks().await?;
        verify(token, &jwks, &self.issuer, audience)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::generate_certificate;
    use crate::db::in_memory_store;
    use crate::model::{EMAIL_CONNECTION, EMAIL_PROVIDER};
    use chrono::Duration;

    const ISSUER: &str = "https://id.example.com/";

    fn tenant() -> Tenant {
        Tenant {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            audience: None,
            created_at: Utc::now(),
        }
    }

    async fn minter() -> TokenMinter {
        let store = Arc::new(in_memory_store("tokens").await.unwrap());
        let keys = Arc::new(KeyManager::new(
            store,
            Duration::days(30),
            Duration::seconds(600),
        ));
        keys.ensure_active().await.unwrap();
        TokenMinter::new(keys, ISSUER, "urn:default")
    }

    #[tokio::test]
    async fn id_token_claims_follow_scope() {
        let minter = minter().await;
        let mut user = User::new("acme", EMAIL_PROVIDER, EMAIL_CONNECTION, false);
        user.email = Some("a@example.com".to_string());
        user.email_verified = true;
        user.name = Some("Alice".to_string());

        let params = AuthParams {
            client_id: "client".to_string(),
            scope: Some("openid email".to_string()),
            nonce: Some("n-1".to_string()),
            ..Default::default()
        };
        let tokens = minter
            .issue(MintRequest {
                tenant: &tenant(),
                client_id: "client",
                user: Some(&user),
                params: &params,
                session_id: Some("sid-1"),
                include_access_token: true,
                include_id_token: true,
            })
            .await
            .unwrap();

        assert_eq!(tokens.expires_in, 86_400);
        let id: IdClaims = minter
            .verify(tokens.id_token.as_deref().unwrap(), Some("client"))
            .await
            .unwrap();
        assert_eq!(id.email.as_deref(), Some("a@example.com"));
        assert_eq!(id.email_verified, Some(true));
        assert_eq!(id.nonce.as_deref(), Some("n-1"));
        assert_eq!(id.sid.as_deref(), Some("sid-1"));
        assert!(id.name.is_none());
        assert_eq!(id.exp - id.iat, TOKEN_LIFETIME_SECS);

        let access: AccessClaims = minter.verify(&tokens.access_token, None).await.unwrap();
        assert_eq!(access.aud, "urn:default");
        assert_eq!(access.sub, user.id);
    }

    #[tokio::test]
    async fn no_id_token_without_openid_scope() {
        let minter = minter().await;
        let user = User::new("acme", EMAIL_PROVIDER, EMAIL_CONNECTION, false);
        let params = AuthParams {
            client_id: "client".to_string(),
            scope: Some("email".to_string()),
            ..Default::default()
        };
        let tokens = minter
            .issue(MintRequest {
                tenant: &tenant(),
                client_id: "client",
                user: Some(&user),
                params: &params,
                session_id: None,
                include_access_token: true,
                include_id_token: true,
            })
            .await
            .unwrap();
        assert!(tokens.id_token.is_none());
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let signer = generate_certificate().unwrap();
        let other = generate_certificate().unwrap();
        let now = Utc::now().timestamp();
        let token = mint(
            &AccessClaims {
                iss: ISSUER.to_string(),
                sub: "u".to_string(),
                aud: "a".to_string(),
                iat: now,
                exp: now + 60,
                scope: String::new(),
                azp: "c".to_string(),
            },
            &signer,
        )
        .unwrap();

        let jwks = JwkSet {
            keys: vec![crate::auth::keys::certificate_jwk(&other).unwrap()],
        };
        let err = verify::<AccessClaims>(&token, &jwks, ISSUER, None).unwrap_err();
        assert!(err.to_string().contains("unknown kid"));
    }

    #[test]
    fn audience_precedence() {
        let mut t = tenant();
        let mut params = AuthParams::default();
        assert_eq!(resolve_audience(&params, &t, "d"), "d");
        t.audience = Some("tenant-aud".to_string());
        assert_eq!(resolve_audience(&params, &t, "d"), "tenant-aud");
        params.audience = Some("req-aud".to_string());
        assert_eq!(resolve_audience(&params, &t, "d"), "req-aud");
    }
}

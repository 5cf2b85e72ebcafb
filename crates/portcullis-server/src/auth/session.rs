//! SSO sessions behind the tenant cookie.
//!
//! The cookie carries a random token; only its keyed hash is stored, so a
//! leaked database cannot be replayed as cookies. Sessions slide forward on
//! each silent-auth hit up to an absolute lifetime, and logout tombstones
//! the row.

use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{random_token, AuthError};
use crate::model::Session;
use crate::store::SessionStore;

type HmacSha256 = Hmac<Sha256>;

/// Sessions expire after this much inactivity.
pub const IDLE_TIMEOUT_DAYS: i64 = 3;
/// Sessions never outlive this, however often they are used.
pub const ABSOLUTE_LIFETIME_DAYS: i64 = 30;

pub fn cookie_name(tenant_id: &str) -> String {
    format!("{}-auth-token", tenant_id)
}

/// The `Set-Cookie` value for a new session.
pub fn session_cookie(tenant_id: &str, token: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((cookie_name(tenant_id), token.to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(if secure { SameSite::None } else { SameSite::Lax })
        .max_age(time::Duration::days(ABSOLUTE_LIFETIME_DAYS))
        .build()
}

/// A cookie that clears the tenant session cookie.
pub fn removal_cookie(tenant_id: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((cookie_name(tenant_id), ""))
        .path("/")
        .http_only(true)
        .secure(secure)
        .max_age(time::Duration::ZERO)
        .build()
}

fn next_expiry(session: &Session, now: DateTime<Utc>) -> DateTime<Utc> {
    let idle = now + Duration::days(IDLE_TIMEOUT_DAYS);
    let absolute = session.created_at + Duration::days(ABSOLUTE_LIFETIME_DAYS);
    idle.min(absolute)
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    hash_key: Option<Vec<u8>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, hash_key: Option<&[u8]>) -> Self {
        Self {
            store,
            hash_key: hash_key.map(|k| k.to_vec()),
        }
    }

    fn token_hash(&self, token: &str) -> Result<String, AuthError> {
        match &self.hash_key {
            Some(key) => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .map_err(|e| AuthError::Crypto(format!("Invalid session hash key: {}", e)))?;
                mac.update(token.as_bytes());
                Ok(hex::encode(mac.finalize().into_bytes()))
            }
            None => {
                let mut hasher = Sha256::new();
                hasher.update(token.as_bytes());
                Ok(hex::encode(hasher.finalize()))
            }
        }
    }

    /// Creates a session and returns it with the cookie token.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        tenant_id: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<(Session, String), AuthError> {
        let token = random_token(32);
        let now = Utc::now();
        let mut session = Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            user_id: user_id.to_string(),
            token_hash: self.token_hash(&token)?,
            created_at: now,
            expires_at: now,
            used_at: now,
            deleted_at: None,
        };
        session.expires_at = next_expiry(&session, now);

        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, "Created session");
        Ok((session, token))
    }

    /// The live session for `token` in `tenant_id`, if any. A session from
    /// another tenant is treated as absent.
    pub async fn load_valid(
        &self,
        tenant_id: &str,
        token: &str,
    ) -> Result<Option<Session>, AuthError> {
        let hash = self.token_hash(token)?;
        let Some(session) = self.store.find_session_by_token_hash(&hash).await? else {
            return Ok(None);
        };

        if session.tenant_id != tenant_id {
            debug!(
                session_id = %session.id,
                tenant_id,
                "Session belongs to another tenant"
            );
            return Ok(None);
        }
        if !session.is_active_at(Utc::now()) {
            debug!(session_id = %session.id, "Session expired or logged out");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Records a silent-auth hit and slides the expiry.
    pub async fn touch(&self, session: &Session) -> Result<Session, AuthError> {
        let now = Utc::now();
        let mut touched = session.clone();
        touched.used_at = now;
        touched.expires_at = next_expiry(session, now);
        self.store
            .touch_session(&touched.id, touched.used_at, touched.expires_at)
            .await?;
        Ok(touched)
    }

    /// Tombstones the session behind `token`. Returns whether one was live.
    #[instrument(skip(self, token))]
    pub async fn logout(&self, tenant_id: &str, token: &str) -> Result<bool, AuthError> {
        let hash = self.token_hash(token)?;
        let Some(session) = self.store.find_session_by_token_hash(&hash).await? else {
            return Ok(false);
        };
        if session.tenant_id != tenant_id {
            return Ok(false);
        }
        let deleted = self.store.tombstone_session(&session.id, Utc::now()).await?;
        if deleted {
            info!(session_id = %session.id, "Session logged out");
        }
        Ok(deleted)
    }
}

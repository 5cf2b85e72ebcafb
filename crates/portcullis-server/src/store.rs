//! Narrow storage interfaces consumed by the authentication core.
//!
//! Each component depends only on the trait it needs. `db::SqlStore`
//! implements all of them over libsql; redemption methods must be atomic
//! check-and-mark operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    Application, AuthorizationCode, Connection, LoginSession, OtpCode, RefreshToken, Session,
    SigningCertificate, Tenant, Ticket, User,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),
}

/// Tenants, applications and connections.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError>;
    async fn get_application(&self, client_id: &str) -> Result<Option<Application>, StoreError>;
    async fn get_connection(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Connection>, StoreError>;
    async fn list_connections(&self, tenant_id: &str) -> Result<Vec<Connection>, StoreError>;

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;
    async fn insert_application(&self, application: &Application) -> Result<(), StoreError>;
    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, tenant_id: &str, user_id: &str) -> Result<Option<User>, StoreError>;
    /// All users (primary and secondary) sharing a normalized email.
    async fn find_users_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Vec<User>, StoreError>;
    async fn find_user_by_email_and_provider(
        &self,
        tenant_id: &str,
        email: &str,
        provider: &str,
    ) -> Result<Option<User>, StoreError>;
    /// Secondary users pointing at `primary_id`, in creation order.
    async fn list_linked_users(
        &self,
        tenant_id: &str,
        primary_id: &str,
    ) -> Result<Vec<User>, StoreError>;
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    async fn update_profile(&self, user: &User) -> Result<(), StoreError>;
    async fn set_password_hash(
        &self,
        tenant_id: &str,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), StoreError>;
    async fn set_email_verified(&self, tenant_id: &str, user_id: &str) -> Result<(), StoreError>;
    /// Points `secondary_id` at `primary_id` only if the secondary is not
    /// already linked. Returns whether a row changed.
    async fn link_user(
        &self,
        tenant_id: &str,
        secondary_id: &str,
        primary_id: &str,
    ) -> Result<bool, StoreError>;
    /// Clears `linked_to` when it currently names `primary_id`.
    async fn unlink_user(
        &self,
        tenant_id: &str,
        secondary_id: &str,
        primary_id: &str,
    ) -> Result<bool, StoreError>;
    async fn record_login(
        &self,
        tenant_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;
    /// Marks the ticket used if it was issued to `client_id` in the tenant
    /// and is unused and unexpired at `now`; returns it on success.
    async fn redeem_ticket(
        &self,
        tenant_id: &str,
        client_id: &str,
        ticket_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError>;
}

#[async_trait]
pub trait OtpStore: Send + Sync {
    async fn insert_otp(&self, otp: &OtpCode) -> Result<(), StoreError>;
    /// Unexpired codes for `email`, newest first.
    async fn find_active_otps(
        &self,
        tenant_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OtpCode>, StoreError>;
    /// Records first use for audit. Does not prevent reuse.
    async fn mark_otp_used(&self, otp_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    async fn find_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError>;
    async fn touch_session(
        &self,
        session_id: &str,
        used_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn tombstone_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait LoginSessionStore: Send + Sync {
    async fn insert_login_session(&self, login: &LoginSession) -> Result<(), StoreError>;
    async fn get_login_session(
        &self,
        login_session_id: &str,
    ) -> Result<Option<LoginSession>, StoreError>;
}

#[async_trait]
pub trait AuthorizationCodeStore: Send + Sync {
    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError>;
    /// Atomic single-use redemption, same semantics as tickets.
    async fn redeem_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationCode>, StoreError>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), StoreError>;
    async fn get_refresh_token(&self, id: &str) -> Result<Option<RefreshToken>, StoreError>;
    async fn revoke_refresh_token(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn insert_certificate(&self, cert: &SigningCertificate) -> Result<(), StoreError>;
    /// All certificates, oldest first.
    async fn list_certificates(&self) -> Result<Vec<SigningCertificate>, StoreError>;
    /// Revokes every non-revoked certificate except `keep_kid`.
    async fn revoke_certificates_except(
        &self,
        keep_kid: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Everything the server needs from durable storage.
pub trait Storage:
    DirectoryStore
    + UserStore
    + TicketStore
    + OtpStore
    + SessionStore
    + LoginSessionStore
    + AuthorizationCodeStore
    + RefreshTokenStore
    + CertificateStore
{
}

impl<T> Storage for T where
    T: DirectoryStore
        + UserStore
        + TicketStore
        + OtpStore
        + SessionStore
        + LoginSessionStore
        + AuthorizationCodeStore
        + RefreshTokenStore
        + CertificateStore
{
}

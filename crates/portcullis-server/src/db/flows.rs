//! Short-lived flow records: tickets, one-time codes, login sessions,
//! authorization codes and refresh tokens.
//!
//! Tickets and authorization codes are redeemed with a conditional UPDATE;
//! the affected-row count decides which concurrent caller wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{
    get_json, get_opt_string, get_opt_ts, get_string, get_ts, query_error, to_json, ts, SqlStore,
};
use crate::model::{
    AuthorizationCode, LoginSession, OtpCode, OtpDelivery, RefreshToken, Ticket,
};
use crate::store::{
    AuthorizationCodeStore, LoginSessionStore, OtpStore, RefreshTokenStore, StoreError,
    TicketStore,
};

fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, StoreError> {
    Ok(Ticket {
        id: get_string(row, 0, "ticket id")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        client_id: get_string(row, 2, "client_id")?,
        email: get_string(row, 3, "email")?,
        user_id: get_string(row, 4, "user_id")?,
        auth_params: get_json(row, 5, "auth_params")?,
        created_at: get_ts(row, 6, "created_at")?,
        expires_at: get_ts(row, 7, "expires_at")?,
        used_at: get_opt_ts(row, 8)?,
    })
}

fn row_to_otp(row: &libsql::Row) -> Result<OtpCode, StoreError> {
    let send = get_string(row, 5, "send")?;
    Ok(OtpCode {
        id: get_string(row, 0, "otp id")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        client_id: get_string(row, 2, "client_id")?,
        email: get_string(row, 3, "email")?,
        code: get_string(row, 4, "code")?,
        send: OtpDelivery::parse(&send)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown otp delivery: {}", send)))?,
        auth_params: get_json(row, 6, "auth_params")?,
        created_at: get_ts(row, 7, "created_at")?,
        expires_at: get_ts(row, 8, "expires_at")?,
        used_at: get_opt_ts(row, 9)?,
    })
}

fn row_to_code(row: &libsql::Row) -> Result<AuthorizationCode, StoreError> {
    Ok(AuthorizationCode {
        code: get_string(row, 0, "code")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        client_id: get_string(row, 2, "client_id")?,
        user_id: get_string(row, 3, "user_id")?,
        auth_params: get_json(row, 4, "auth_params")?,
        session_id: get_opt_string(row, 5),
        created_at: get_ts(row, 6, "created_at")?,
        expires_at: get_ts(row, 7, "expires_at")?,
        used_at: get_opt_ts(row, 8)?,
    })
}

#[async_trait]
impl TicketStore for SqlStore {
    #[instrument(skip(self, ticket), fields(tenant_id = %ticket.tenant_id))]
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let auth_params = to_json(&ticket.auth_params, "auth_params")?;
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO tickets (
                id, tenant_id, client_id, email, user_id, auth_params, created_at, expires_at, used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                ticket.id.as_str(),
                ticket.tenant_id.as_str(),
                ticket.client_id.as_str(),
                ticket.email.as_str(),
                ticket.user_id.as_str(),
                auth_params,
                ts(ticket.created_at),
                ts(ticket.expires_at),
                ticket.used_at.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert ticket"))?;
        Ok(())
    }

    #[instrument(skip(self, ticket_id))]
    async fn redeem_ticket(
        &self,
        tenant_id: &str,
        client_id: &str,
        ticket_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError> {
        let conn = self.conn().await?;
        let now = ts(now);
        let changed = conn
            .execute(
                r#"
                UPDATE tickets SET used_at = ?
                WHERE id = ? AND tenant_id = ? AND client_id = ?
                  AND used_at IS NULL AND expires_at > ?
                "#,
                libsql::params![now.as_str(), ticket_id, tenant_id, client_id, now.as_str()],
            )
            .await
            .map_err(query_error("Failed to redeem ticket"))?;

        if changed != 1 {
            debug!("Ticket redemption rejected");
            return Ok(None);
        }

        let mut rows = conn
            .query(
                r#"
                SELECT id, tenant_id, client_id, email, user_id, auth_params, created_at,
                       expires_at, used_at
                FROM tickets WHERE id = ?
                "#,
                libsql::params![ticket_id],
            )
            .await
            .map_err(query_error("Failed to load ticket"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read ticket row"))?
        {
            Some(row) => Ok(Some(row_to_ticket(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OtpStore for SqlStore {
    #[instrument(skip(self, otp), fields(tenant_id = %otp.tenant_id))]
    async fn insert_otp(&self, otp: &OtpCode) -> Result<(), StoreError> {
        let auth_params = to_json(&otp.auth_params, "auth_params")?;
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO otp_codes (
                id, tenant_id, client_id, email, code, send, auth_params, created_at,
                expires_at, used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                otp.id.as_str(),
                otp.tenant_id.as_str(),
                otp.client_id.as_str(),
                otp.email.as_str(),
                otp.code.as_str(),
                otp.send.as_str(),
                auth_params,
                ts(otp.created_at),
                ts(otp.expires_at),
                otp.used_at.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert otp code"))?;
        Ok(())
    }

    #[instrument(skip(self, email))]
    async fn find_active_otps(
        &self,
        tenant_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OtpCode>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, tenant_id, client_id, email, code, send, auth_params, created_at,
                       expires_at, used_at
                FROM otp_codes
                WHERE tenant_id = ? AND email = ? AND expires_at > ?
                ORDER BY created_at DESC
                "#,
                libsql::params![tenant_id, email, ts(now)],
            )
            .await
            .map_err(query_error("Failed to query otp codes"))?;

        let mut codes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_error("Failed to read otp row"))?
        {
            codes.push(row_to_otp(&row)?);
        }
        Ok(codes)
    }

    async fn mark_otp_used(&self, otp_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE otp_codes SET used_at = ? WHERE id = ? AND used_at IS NULL",
            libsql::params![ts(now), otp_id],
        )
        .await
        .map_err(query_error("Failed to mark otp used"))?;
        Ok(())
    }
}

#[async_trait]
impl LoginSessionStore for SqlStore {
    async fn insert_login_session(&self, login: &LoginSession) -> Result<(), StoreError> {
        let auth_params = to_json(&login.auth_params, "auth_params")?;
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO login_sessions (id, tenant_id, client_id, auth_params, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                login.id.as_str(),
                login.tenant_id.as_str(),
                login.client_id.as_str(),
                auth_params,
                ts(login.created_at),
                ts(login.expires_at)
            ],
        )
        .await
        .map_err(query_error("Failed to insert login session"))?;
        Ok(())
    }

    async fn get_login_session(
        &self,
        login_session_id: &str,
    ) -> Result<Option<LoginSession>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, tenant_id, client_id, auth_params, created_at, expires_at
                FROM login_sessions WHERE id = ?
                "#,
                libsql::params![login_session_id],
            )
            .await
            .map_err(query_error("Failed to query login session"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read login session row"))?
        {
            Some(row) => Ok(Some(LoginSession {
                id: get_string(&row, 0, "login session id")?,
                tenant_id: get_string(&row, 1, "tenant_id")?,
                client_id: get_string(&row, 2, "client_id")?,
                auth_params: get_json(&row, 3, "auth_params")?,
                created_at: get_ts(&row, 4, "created_at")?,
                expires_at: get_ts(&row, 5, "expires_at")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AuthorizationCodeStore for SqlStore {
    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        let auth_params = to_json(&code.auth_params, "auth_params")?;
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO authorization_codes (
                code, tenant_id, client_id, user_id, auth_params, session_id, created_at,
                expires_at, used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                code.code.as_str(),
                code.tenant_id.as_str(),
                code.client_id.as_str(),
                code.user_id.as_str(),
                auth_params,
                code.session_id.clone(),
                ts(code.created_at),
                ts(code.expires_at),
                code.used_at.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert authorization code"))?;
        Ok(())
    }

    #[instrument(skip(self, code))]
    async fn redeem_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        let conn = self.conn().await?;
        let now = ts(now);
        let changed = conn
            .execute(
                r#"
                UPDATE authorization_codes SET used_at = ?
                WHERE code = ? AND used_at IS NULL AND expires_at > ?
                "#,
                libsql::params![now.as_str(), code, now.as_str()],
            )
            .await
            .map_err(query_error("Failed to redeem authorization code"))?;

        if changed != 1 {
            return Ok(None);
        }

        let mut rows = conn
            .query(
                r#"
                SELECT code, tenant_id, client_id, user_id, auth_params, session_id, created_at,
                       expires_at, used_at
                FROM authorization_codes WHERE code = ?
                "#,
                libsql::params![code],
            )
            .await
            .map_err(query_error("Failed to load authorization code"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read authorization code row"))?
        {
            Some(row) => Ok(Some(row_to_code(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RefreshTokenStore for SqlStore {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO refresh_tokens (
                id, tenant_id, client_id, user_id, scope, audience, session_id, created_at, revoked_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                token.id.as_str(),
                token.tenant_id.as_str(),
                token.client_id.as_str(),
                token.user_id.as_str(),
                token.scope.as_str(),
                token.audience.as_str(),
                token.session_id.clone(),
                ts(token.created_at),
                token.revoked_at.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert refresh token"))?;
        Ok(())
    }

    async fn get_refresh_token(&self, id: &str) -> Result<Option<RefreshToken>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, tenant_id, client_id, user_id, scope, audience, session_id,
                       created_at, revoked_at
                FROM refresh_tokens WHERE id = ?
                "#,
                libsql::params![id],
            )
            .await
            .map_err(query_error("Failed to query refresh token"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read refresh token row"))?
        {
            Some(row) => Ok(Some(RefreshToken {
                id: get_string(&row, 0, "refresh token id")?,
                tenant_id: get_string(&row, 1, "tenant_id")?,
                client_id: get_string(&row, 2, "client_id")?,
                user_id: get_string(&row, 3, "user_id")?,
                scope: get_string(&row, 4, "scope")?,
                audience: get_string(&row, 5, "audience")?,
                session_id: get_opt_string(&row, 6),
                created_at: get_ts(&row, 7, "created_at")?,
                revoked_at: get_opt_ts(&row, 8)?,
            })),
            None => Ok(None),
        }
    }

    async fn revoke_refresh_token(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
            libsql::params![ts(now), id],
        )
        .await
        .map_err(query_error("Failed to revoke refresh token"))?;
        Ok(())
    }
}

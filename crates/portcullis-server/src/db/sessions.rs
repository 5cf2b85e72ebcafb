use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::{get_opt_ts, get_string, get_ts, query_error, ts, SqlStore};
use crate::model::Session;
use crate::store::{SessionStore, StoreError};

const SESSION_COLUMNS: &str =
    "id, tenant_id, client_id, user_id, token_hash, created_at, expires_at, used_at, deleted_at";

fn row_to_session(row: &libsql::Row) -> Result<Session, StoreError> {
    Ok(Session {
        id: get_string(row, 0, "session id")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        client_id: get_string(row, 2, "client_id")?,
        user_id: get_string(row, 3, "user_id")?,
        token_hash: get_string(row, 4, "token_hash")?,
        created_at: get_ts(row, 5, "created_at")?,
        expires_at: get_ts(row, 6, "expires_at")?,
        used_at: get_ts(row, 7, "used_at")?,
        deleted_at: get_opt_ts(row, 8)?,
    })
}

impl SqlStore {
    async fn query_session(
        &self,
        filter: &str,
        value: &str,
    ) -> Result<Option<Session>, StoreError> {
        let sql = format!("SELECT {} FROM sessions WHERE {} = ?", SESSION_COLUMNS, filter);
        let conn = self.conn().await?;
        let mut rows = conn
            .query(&sql, libsql::params![value])
            .await
            .map_err(query_error("Failed to query session"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read session row"))?
        {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for SqlStore {
    #[instrument(skip(self, session), fields(tenant_id = %session.tenant_id, session_id = %session.id))]
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO sessions (
                id, tenant_id, client_id, user_id, token_hash, created_at, expires_at, used_at,
                deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                session.id.as_str(),
                session.tenant_id.as_str(),
                session.client_id.as_str(),
                session.user_id.as_str(),
                session.token_hash.as_str(),
                ts(session.created_at),
                ts(session.expires_at),
                ts(session.used_at),
                session.deleted_at.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert session"))?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.query_session("id", session_id).await
    }

    async fn find_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.query_session("token_hash", token_hash).await
    }

    async fn touch_session(
        &self,
        session_id: &str,
        used_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE sessions SET used_at = ?, expires_at = ? WHERE id = ? AND deleted_at IS NULL",
            libsql::params![ts(used_at), ts(expires_at), session_id],
        )
        .await
        .map_err(query_error("Failed to touch session"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn tombstone_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                "UPDATE sessions SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
                libsql::params![ts(now), session_id],
            )
            .await
            .map_err(query_error("Failed to delete session"))?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory_store;
    use chrono::Duration;

    #[tokio::test]
    async fn tombstoned_session_is_kept_but_inactive() {
        let store = in_memory_store("sessions").await.unwrap();
        let now = Utc::now();
        let session = Session {
            id: "sess-1".to_string(),
            tenant_id: "acme".to_string(),
            client_id: "client".to_string(),
            user_id: "email|1".to_string(),
            token_hash: "abc".to_string(),
            created_at: now,
            expires_at: now + Duration::days(1),
            used_at: now,
            deleted_at: None,
        };
        store.insert_session(&session).await.unwrap();

        let found = store.find_session_by_token_hash("abc").await.unwrap().unwrap();
        assert!(found.is_active_at(now));

        assert!(store.tombstone_session("sess-1", now).await.unwrap());
        assert!(!store.tombstone_session("sess-1", now).await.unwrap());

        let found = store.get_session("sess-1").await.unwrap().unwrap();
        assert!(found.deleted_at.is_some());
        assert!(!found.is_active_at(now));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{
    get_bool, get_opt_string, get_opt_ts, get_string, get_ts, query_error, to_json, ts, SqlStore,
};
use crate::model::User;
use crate::store::{StoreError, UserStore};

const USER_COLUMNS: &str = r#"
    id, tenant_id, email, email_verified, name, nickname, picture, locale, connection,
    provider, is_social, linked_to, password_hash, profile_data, created_at, updated_at,
    last_login
"#;

fn row_to_user(row: &libsql::Row) -> Result<User, StoreError> {
    let profile_data = get_opt_string(row, 13)
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("Failed to decode profile_data: {}", e)))
        })
        .transpose()?;

    Ok(User {
        id: get_string(row, 0, "user id")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        email: get_opt_string(row, 2),
        email_verified: get_bool(row, 3),
        name: get_opt_string(row, 4),
        nickname: get_opt_string(row, 5),
        picture: get_opt_string(row, 6),
        locale: get_opt_string(row, 7),
        connection: get_string(row, 8, "connection")?,
        provider: get_string(row, 9, "provider")?,
        is_social: get_bool(row, 10),
        linked_to: get_opt_string(row, 11),
        password_hash: get_opt_string(row, 12),
        profile_data,
        created_at: get_ts(row, 14, "created_at")?,
        updated_at: get_ts(row, 15, "updated_at")?,
        last_login: get_opt_ts(row, 16)?,
    })
}

impl SqlStore {
    async fn query_users(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<User>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(query_error("Failed to query users"))?;

        let mut users = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_error("Failed to read user row"))?
        {
            users.push(row_to_user(&row)?);
        }
        Ok(users)
    }
}

#[async_trait]
impl UserStore for SqlStore {
    #[instrument(skip(self))]
    async fn get_user(&self, tenant_id: &str, user_id: &str) -> Result<Option<User>, StoreError> {
        let sql = format!(
            "SELECT {} FROM users WHERE tenant_id = ? AND id = ?",
            USER_COLUMNS
        );
        let mut users = self
            .query_users(&sql, libsql::params![tenant_id, user_id])
            .await?;
        Ok(users.pop())
    }

    #[instrument(skip(self))]
    async fn find_users_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            "SELECT {} FROM users WHERE tenant_id = ? AND email = ? ORDER BY created_at, rowid",
            USER_COLUMNS
        );
        self.query_users(&sql, libsql::params![tenant_id, email])
            .await
    }

    #[instrument(skip(self))]
    async fn find_user_by_email_and_provider(
        &self,
        tenant_id: &str,
        email: &str,
        provider: &str,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM users
            WHERE tenant_id = ? AND email = ? AND provider = ?
            ORDER BY created_at, rowid
            LIMIT 1
            "#,
            USER_COLUMNS
        );
        let mut users = self
            .query_users(&sql, libsql::params![tenant_id, email, provider])
            .await?;
        Ok(users.pop())
    }

    #[instrument(skip(self))]
    async fn list_linked_users(
        &self,
        tenant_id: &str,
        primary_id: &str,
    ) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            "SELECT {} FROM users WHERE tenant_id = ? AND linked_to = ? ORDER BY created_at, rowid",
            USER_COLUMNS
        );
        self.query_users(&sql, libsql::params![tenant_id, primary_id])
            .await
    }

    #[instrument(skip(self, user), fields(tenant_id = %user.tenant_id, user_id = %user.id))]
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let profile_data = user
            .profile_data
            .as_ref()
            .map(|p| to_json(p, "profile_data"))
            .transpose()?;

        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO users (
                id, tenant_id, email, email_verified, name, nickname, picture, locale,
                connection, provider, is_social, linked_to, password_hash, profile_data,
                created_at, updated_at, last_login
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                user.id.as_str(),
                user.tenant_id.as_str(),
                user.email.clone(),
                user.email_verified as i64,
                user.name.clone(),
                user.nickname.clone(),
                user.picture.clone(),
                user.locale.clone(),
                user.connection.as_str(),
                user.provider.as_str(),
                user.is_social as i64,
                user.linked_to.clone(),
                user.password_hash.clone(),
                profile_data,
                ts(user.created_at),
                ts(user.updated_at),
                user.last_login.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert user"))?;

        debug!("User created");
        Ok(())
    }

    async fn update_profile(&self, user: &User) -> Result<(), StoreError> {
        let profile_data = user
            .profile_data
            .as_ref()
            .map(|p| to_json(p, "profile_data"))
            .transpose()?;

        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE users
            SET email = ?, email_verified = ?, name = ?, nickname = ?, picture = ?, locale = ?,
                profile_data = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ?
            "#,
            libsql::params![
                user.email.clone(),
                user.email_verified as i64,
                user.name.clone(),
                user.nickname.clone(),
                user.picture.clone(),
                user.locale.clone(),
                profile_data,
                ts(Utc::now()),
                user.tenant_id.as_str(),
                user.id.as_str()
            ],
        )
        .await
        .map_err(query_error("Failed to update user profile"))?;
        Ok(())
    }

    async fn set_password_hash(
        &self,
        tenant_id: &str,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET password_hash = ?, updated_at = ? WHERE tenant_id = ? AND id = ?",
            libsql::params![password_hash, ts(Utc::now()), tenant_id, user_id],
        )
        .await
        .map_err(query_error("Failed to update password"))?;
        Ok(())
    }

    async fn set_email_verified(&self, tenant_id: &str, user_id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET email_verified = 1, updated_at = ? WHERE tenant_id = ? AND id = ?",
            libsql::params![ts(Utc::now()), tenant_id, user_id],
        )
        .await
        .map_err(query_error("Failed to mark email verified"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn link_user(
        &self,
        tenant_id: &str,
        secondary_id: &str,
        primary_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE users SET linked_to = ?, updated_at = ?
                WHERE tenant_id = ? AND id = ? AND linked_to IS NULL
                "#,
                libsql::params![primary_id, ts(Utc::now()), tenant_id, secondary_id],
            )
            .await
            .map_err(query_error("Failed to link user"))?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn unlink_user(
        &self,
        tenant_id: &str,
        secondary_id: &str,
        primary_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE users SET linked_to = NULL, updated_at = ?
                WHERE tenant_id = ? AND id = ? AND linked_to = ?
                "#,
                libsql::params![ts(Utc::now()), tenant_id, secondary_id, primary_id],
            )
            .await
            .map_err(query_error("Failed to unlink user"))?;
        Ok(changed == 1)
    }

    async fn record_login(
        &self,
        tenant_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET last_login = ? WHERE tenant_id = ? AND id = ?",
            libsql::params![ts(at), tenant_id, user_id],
        )
        .await
        .map_err(query_error("Failed to record login"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory_store;
    use crate::model::{DATABASE_CONNECTION, DATABASE_PROVIDER, EMAIL_CONNECTION, EMAIL_PROVIDER};

    fn user(provider: &str, connection: &str, email: &str) -> User {
        let mut user = User::new("acme", provider, connection, false);
        user.email = Some(email.to_string());
        user
    }

    #[tokio::test]
    async fn user_round_trip_keeps_password_hash() {
        let store = in_memory_store("users").await.unwrap();
        let mut u = user(DATABASE_PROVIDER, DATABASE_CONNECTION, "a@example.com");
        u.password_hash = Some("$argon2id$hash".to_string());
        store.insert_user(&u).await.unwrap();

        let loaded = store.get_user("acme", &u.id).await.unwrap().unwrap();
        assert_eq!(loaded.password_hash.as_deref(), Some("$argon2id$hash"));
        assert_eq!(loaded.email.as_deref(), Some("a@example.com"));
        assert!(store.get_user("other", &u.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn link_is_conditional_on_unlinked_secondary() {
        let store = in_memory_store("users-link").await.unwrap();
        let primary = user(EMAIL_PROVIDER, EMAIL_CONNECTION, "a@example.com");
        let other_primary = user(EMAIL_PROVIDER, EMAIL_CONNECTION, "b@example.com");
        let secondary = user(DATABASE_PROVIDER, DATABASE_CONNECTION, "a@example.com");
        for u in [&primary, &other_primary, &secondary] {
            store.insert_user(u).await.unwrap();
        }

        assert!(store.link_user("acme", &secondary.id, &primary.id).await.unwrap());
        assert!(!store
            .link_user("acme", &secondary.id, &other_primary.id)
            .await
            .unwrap());

        let linked = store.list_linked_users("acme", &primary.id).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, secondary.id);

        assert!(!store
            .unlink_user("acme", &secondary.id, &other_primary.id)
            .await
            .unwrap());
        assert!(store.unlink_user("acme", &secondary.id, &primary.id).await.unwrap());
        let reloaded = store.get_user("acme", &secondary.id).await.unwrap().unwrap();
        assert!(reloaded.linked_to.is_none());
    }

    #[tokio::test]
    async fn find_by_email_and_provider_filters_provider() {
        let store = in_memory_store("users-email").await.unwrap();
        let passwordless = user(EMAIL_PROVIDER, EMAIL_CONNECTION, "a@example.com");
        let database = user(DATABASE_PROVIDER, DATABASE_CONNECTION, "a@example.com");
        store.insert_user(&passwordless).await.unwrap();
        store.insert_user(&database).await.unwrap();

        let found = store
            .find_user_by_email_and_provider("acme", "a@example.com", DATABASE_PROVIDER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, database.id);
        assert_eq!(
            store
                .find_users_by_email("acme", "a@example.com")
                .await
                .unwrap()
                .len(),
            2
        );
    }
}

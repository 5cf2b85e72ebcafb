use async_trait::async_trait;
use tracing::instrument;

use super::{get_json, get_string, get_ts, query_error, to_json, ts, SqlStore};
use crate::model::{Application, Connection, ConnectionStrategy, Tenant};
use crate::store::{DirectoryStore, StoreError};

fn row_to_application(row: &libsql::Row) -> Result<Application, StoreError> {
    Ok(Application {
        id: get_string(row, 0, "client_id")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        name: get_string(row, 2, "name")?,
        client_secret: super::get_opt_string(row, 3),
        callbacks: get_json(row, 4, "callbacks")?,
        allowed_logout_urls: get_json(row, 5, "allowed_logout_urls")?,
        web_origins: get_json(row, 6, "web_origins")?,
        created_at: get_ts(row, 7, "created_at")?,
    })
}

fn row_to_connection(row: &libsql::Row) -> Result<Connection, StoreError> {
    Ok(Connection {
        id: get_string(row, 0, "connection id")?,
        tenant_id: get_string(row, 1, "tenant_id")?,
        name: get_string(row, 2, "name")?,
        strategy: ConnectionStrategy::parse(&get_string(row, 3, "strategy")?),
    })
}

#[async_trait]
impl DirectoryStore for SqlStore {
    #[instrument(skip(self))]
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, audience, created_at FROM tenants WHERE id = ?",
                libsql::params![tenant_id],
            )
            .await
            .map_err(query_error("Failed to query tenant"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read tenant row"))?
        {
            Some(row) => Ok(Some(Tenant {
                id: get_string(&row, 0, "tenant id")?,
                name: get_string(&row, 1, "tenant name")?,
                audience: super::get_opt_string(&row, 2),
                created_at: get_ts(&row, 3, "created_at")?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_application(&self, client_id: &str) -> Result<Option<Application>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, tenant_id, name, client_secret, callbacks, allowed_logout_urls,
                       web_origins, created_at
                FROM applications
                WHERE id = ?
                "#,
                libsql::params![client_id],
            )
            .await
            .map_err(query_error("Failed to query application"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read application row"))?
        {
            Some(row) => Ok(Some(row_to_application(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_connection(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Connection>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, tenant_id, name, strategy FROM connections WHERE tenant_id = ? AND name = ?",
                libsql::params![tenant_id, name],
            )
            .await
            .map_err(query_error("Failed to query connection"))?;

        match rows
            .next()
            .await
            .map_err(query_error("Failed to read connection row"))?
        {
            Some(row) => Ok(Some(row_to_connection(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn list_connections(&self, tenant_id: &str) -> Result<Vec<Connection>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, tenant_id, name, strategy FROM connections WHERE tenant_id = ? ORDER BY name",
                libsql::params![tenant_id],
            )
            .await
            .map_err(query_error("Failed to query connections"))?;

        let mut connections = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_error("Failed to read connection row"))?
        {
            connections.push(row_to_connection(&row)?);
        }
        Ok(connections)
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO tenants (id, name, audience, created_at) VALUES (?, ?, ?, ?)",
            libsql::params![
                tenant.id.as_str(),
                tenant.name.as_str(),
                tenant.audience.clone(),
                ts(tenant.created_at)
            ],
        )
        .await
        .map_err(query_error("Failed to insert tenant"))?;
        Ok(())
    }

    async fn insert_application(&self, application: &Application) -> Result<(), StoreError> {
        let callbacks = to_json(&application.callbacks, "callbacks")?;
        let logout_urls = to_json(&application.allowed_logout_urls, "allowed_logout_urls")?;
        let web_origins = to_json(&application.web_origins, "web_origins")?;

        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO applications (
                id, tenant_id, name, client_secret, callbacks, allowed_logout_urls,
                web_origins, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                application.id.as_str(),
                application.tenant_id.as_str(),
                application.name.as_str(),
                application.client_secret.clone(),
                callbacks,
                logout_urls,
                web_origins,
                ts(application.created_at)
            ],
        )
        .await
        .map_err(query_error("Failed to insert application"))?;
        Ok(())
    }

    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO connections (id, tenant_id, name, strategy) VALUES (?, ?, ?, ?)",
            libsql::params![
                connection.id.as_str(),
                connection.tenant_id.as_str(),
                connection.name.as_str(),
                connection.strategy.as_str()
            ],
        )
        .await
        .map_err(query_error("Failed to insert connection"))?;
        Ok(())
    }
}

//! Seeding tenants, applications and connections from a JSON file.
//!
//! ```json
//! {
//!   "tenants": [{"id": "acme", "name": "Acme"}],
//!   "applications": [{"id": "spa", "tenant_id": "acme", "name": "SPA",
//!                     "callbacks": ["https://app.example.com/callback"]}],
//!   "connections": [{"id": "acme-email", "tenant_id": "acme",
//!                    "name": "email", "strategy": "email"}]
//! }
//! ```
//!
//! Rows that already exist are left as they are.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Application, Connection, Tenant};
use crate::store::{DirectoryStore, StoreError};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Failed to read bootstrap file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid bootstrap file: {0}")]
    Parse(String),

    #[error("Application {application} names unknown tenant {tenant}")]
    UnknownTenant { application: String, tenant: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// What a seeding run inserted.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub tenants: usize,
    pub applications: usize,
    pub connections: usize,
}

impl Bootstrap {
    pub fn parse(raw: &str) -> Result<Self, BootstrapError> {
        serde_json::from_str(raw).map_err(|e| BootstrapError::Parse(e.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BootstrapError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::parse(&raw)
    }

    /// Inserts every missing row.
    pub async fn apply(&self, store: &dyn DirectoryStore) -> Result<SeedReport, BootstrapError> {
        let mut report = SeedReport::default();

        for tenant in &self.tenants {
            if store.get_tenant(&tenant.id).await?.is_some() {
                debug!(tenant_id = %tenant.id, "Tenant already present");
                continue;
            }
            store.insert_tenant(tenant).await?;
            report.tenants += 1;
        }

        for application in &self.applications {
            if store.get_tenant(&application.tenant_id).await?.is_none() {
                return Err(BootstrapError::UnknownTenant {
                    application: application.id.clone(),
                    tenant: application.tenant_id.clone(),
                });
            }
            if store.get_application(&application.id).await?.is_some() {
                continue;
            }
            store.insert_application(application).await?;
            report.applications += 1;
        }

        for connection in &self.connections {
            if store
                .get_connection(&connection.tenant_id, &connection.name)
                .await?
                .is_some()
            {
                continue;
            }
            store.insert_connection(connection).await?;
            report.connections += 1;
        }

        info!(
            tenants = report.tenants,
            applications = report.applications,
            connections = report.connections,
            "Bootstrap applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory_store;
    use crate::model::ConnectionStrategy;

    const SEED: &str = r#"{
        "tenants": [{"id": "acme", "name": "Acme", "audience": "https://api.acme.example"}],
        "applications": [{
            "id": "spa",
            "tenant_id": "acme",
            "name": "SPA",
            "callbacks": ["https://app.example.com/callback"]
        }],
        "connections": [
            {"id": "c1", "tenant_id": "acme", "name": "Username-Password-Authentication", "strategy": "auth0"},
            {"id": "c2", "tenant_id": "acme", "name": "google-oauth2", "strategy": "google-oauth2"}
        ]
    }"#;

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = in_memory_store("bootstrap").await.unwrap();
        let seed = Bootstrap::parse(SEED).unwrap();

        let first = seed.apply(&store).await.unwrap();
        assert_eq!(
            first,
            SeedReport {
                tenants: 1,
                applications: 1,
                connections: 2
            }
        );
        let second = seed.apply(&store).await.unwrap();
        assert_eq!(second, SeedReport::default());

        let app = store.get_application("spa").await.unwrap().unwrap();
        assert!(app.allows_callback("https://app.example.com/callback"));
        let google = store
            .get_connection("acme", "google-oauth2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            google.strategy,
            ConnectionStrategy::Social("google-oauth2".to_string())
        );
    }

    #[tokio::test]
    async fn application_for_missing_tenant_is_rejected() {
        let store = in_memory_store("bootstrap-orphan").await.unwrap();
        let seed = Bootstrap::parse(
            r#"{"applications": [{"id": "x", "tenant_id": "ghost", "name": "X"}]}"#,
        )
        .unwrap();
        let err = seed.apply(&store).await.unwrap_err();
        assert!(matches!(err, BootstrapError::UnknownTenant { .. }));
    }
}

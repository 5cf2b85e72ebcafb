use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::{get_opt_ts, get_string, get_ts, query_error, ts, SqlStore};
use crate::model::SigningCertificate;
use crate::store::{CertificateStore, StoreError};

#[async_trait]
impl CertificateStore for SqlStore {
    #[instrument(skip(self, cert), fields(kid = %cert.kid))]
    async fn insert_certificate(&self, cert: &SigningCertificate) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO signing_certificates (kid, public_key, private_key, created_at, revoked_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            libsql::params![
                cert.kid.as_str(),
                cert.public_key.as_str(),
                cert.private_key.as_str(),
                ts(cert.created_at),
                cert.revoked_at.map(ts)
            ],
        )
        .await
        .map_err(query_error("Failed to insert signing certificate"))?;
        Ok(())
    }

    async fn list_certificates(&self) -> Result<Vec<SigningCertificate>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT kid, public_key, private_key, created_at, revoked_at
                FROM signing_certificates
                ORDER BY created_at, rowid
                "#,
                (),
            )
            .await
            .map_err(query_error("Failed to query signing certificates"))?;

        let mut certs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_error("Failed to read certificate row"))?
        {
            certs.push(SigningCertificate {
                kid: get_string(&row, 0, "kid")?,
                public_key: get_string(&row, 1, "public_key")?,
                private_key: get_string(&row, 2, "private_key")?,
                created_at: get_ts(&row, 3, "created_at")?,
                revoked_at: get_opt_ts(&row, 4)?,
            });
        }
        Ok(certs)
    }

    #[instrument(skip(self))]
    async fn revoke_certificates_except(
        &self,
        keep_kid: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.conn().await?;
        let revoked = conn
            .execute(
                "UPDATE signing_certificates SET revoked_at = ? WHERE kid != ? AND revoked_at IS NULL",
                libsql::params![ts(now), keep_kid],
            )
            .await
            .map_err(query_error("Failed to revoke signing certificates"))?;
        if revoked > 0 {
            info!(revoked, "Revoked previous signing certificates");
        }
        Ok(revoked)
    }
}

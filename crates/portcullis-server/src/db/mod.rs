//! libSQL storage for Portcullis.
//!
//! `Database` wraps a libsql handle. In-memory databases keep one persistent
//! connection behind a mutex, since every fresh connection to `:memory:`
//! would see an empty database. `SqlStore` implements the `store` traits on
//! top of it; its impls are split per record family.

mod certificates;
mod directory;
mod flows;
mod migrations;
mod sessions;
mod users;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

pub use migrations::{Migration, MigrationRunner};

use crate::store::StoreError;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    persistent: Option<Arc<Mutex<Connection>>>,
}

/// A connection borrowed from a `Database`.
pub enum DbConnection<'a> {
    Shared(MutexGuard<'a, Connection>),
    Owned(Connection),
}

impl Deref for DbConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            DbConnection::Shared(guard) => guard,
            DbConnection::Owned(conn) => conn,
        }
    }
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionFailed(format!(
                        "Failed to create database directory: {}",
                        e
                    ))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Borrow a connection: the shared one for in-memory databases, a fresh
    /// one otherwise.
    pub async fn connection(&self) -> Result<DbConnection<'_>, DatabaseError> {
        match &self.persistent {
            Some(persistent) => Ok(DbConnection::Shared(persistent.lock().await)),
            None => Ok(DbConnection::Owned(self.db.connect()?)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.connection().await?;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// libsql-backed implementation of every storage trait.
#[derive(Clone)]
pub struct SqlStore {
    db: Database,
}

impl SqlStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn conn(&self) -> Result<DbConnection<'_>, StoreError> {
        Ok(self.db.connection().await?)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 strings so that SQL string
/// comparison orders them correctly.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }

    Err(StoreError::Corrupt(format!(
        "failed to parse timestamp: {}",
        value
    )))
}

fn query_error(context: &str) -> impl FnOnce(libsql::Error) -> StoreError + '_ {
    move |e| {
        let msg = e.to_string();
        if msg.contains("UNIQUE") {
            StoreError::Duplicate(format!("{}: {}", context, msg))
        } else {
            StoreError::Backend(format!("{}: {}", context, msg))
        }
    }
}

fn get_string(row: &libsql::Row, idx: i32, column: &str) -> Result<String, StoreError> {
    row.get::<String>(idx)
        .map_err(|e| StoreError::Corrupt(format!("Failed to get {}: {}", column, e)))
}

fn get_opt_string(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<Option<String>>(idx).ok().flatten()
}

fn get_bool(row: &libsql::Row, idx: i32) -> bool {
    row.get::<i64>(idx).map(|v| v != 0).unwrap_or(false)
}

fn get_ts(row: &libsql::Row, idx: i32, column: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_ts(&get_string(row, idx, column)?)
}

fn get_opt_ts(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>, StoreError> {
    get_opt_string(row, idx).map(|v| parse_ts(&v)).transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(
    row: &libsql::Row,
    idx: i32,
    column: &str,
) -> Result<T, StoreError> {
    let raw = get_string(row, idx, column)?;
    serde_json::from_str(&raw)
        .map_err(|e| StoreError::Corrupt(format!("Failed to decode {}: {}", column, e)))
}

fn to_json<T: serde::Serialize>(value: &T, column: &str) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Corrupt(format!("Failed to encode {}: {}", column, e)))
}

/// Build a migrated in-memory store.
pub async fn in_memory_store(name: &str) -> Result<SqlStore, DatabaseError> {
    let db = Database::in_memory(name).await?;
    MigrationRunner::standard().run(&db).await?;
    Ok(SqlStore::new(db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn in_memory_database_is_healthy() {
        let db = Database::in_memory("test").await.unwrap();
        assert_eq!(db.name(), "test");
        assert!(db.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_database_keeps_data_across_connections() {
        let db = Database::in_memory("test").await.unwrap();
        {
            let conn = db.connection().await.unwrap();
            conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ())
                .await
                .unwrap();
            conn.execute("INSERT INTO t (name) VALUES ('hello')", ())
                .await
                .unwrap();
        }

        let conn = db.connection().await.unwrap();
        let mut rows = conn.query("SELECT name FROM t", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "hello");
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let later = earlier + chrono::Duration::milliseconds(1500);
        assert!(ts(earlier) < ts(later));
        assert_eq!(parse_ts(&ts(earlier)).unwrap(), earlier);
    }

    #[test]
    fn parse_ts_accepts_sqlite_datetime() {
        let parsed = parse_ts("2026-01-02 03:04:05").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
    }
}

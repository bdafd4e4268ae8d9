//! libSQL storage for the server.
//!
//! A single connection is opened per database and shared behind an async
//! mutex. For `:memory:` databases this is what keeps the data alive: every
//! fresh libSQL connection to an in-memory database sees an empty schema.

mod gateway;
mod migrations;

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

pub use gateway::LibSqlGateway;
pub use migrations::MigrationRunner;

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

/// Wrapper around a libsql database and its shared connection
#[derive(Clone)]
pub struct Database {
    // Owns the handle the shared connection was opened from.
    _db: Arc<LibSqlDatabase>,
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        Self::from_libsql(name, db)
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;
        info!("Opened database '{}' at {:?}", name, path);
        Self::from_libsql(name, db)
    }

    /// Open the configured database: a file when `path` is set, memory otherwise.
    pub async fn open(name: &str, path: Option<&str>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => Self::open_local(name, path).await,
            None => {
                warn!("No database path configured, data will not survive a restart");
                Self::in_memory(name).await
            }
        }
    }

    fn from_libsql(name: &str, db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db.connect()?;
        Ok(Self {
            _db: Arc::new(db),
            conn: Arc::new(Mutex::new(conn)),
            name: name.to_string(),
        })
    }

    /// Exclusive access to the shared connection.
    pub async fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> bool {
        let conn = self.connection().await;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Database health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory("test").await.unwrap();
        assert_eq!(db.name(), "test");
        assert!(db.health_check().await);
    }

    #[tokio::test]
    async fn test_in_memory_data_survives_across_calls() {
        let db = Database::in_memory("test").await.unwrap();
        {
            let conn = db.connection().await;
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)", ())
                .await
                .unwrap();
            conn.execute("INSERT INTO test (name) VALUES ('hello')", ())
                .await
                .unwrap();
        }

        let conn = db.connection().await;
        let mut rows = conn.query("SELECT name FROM test", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let name: String = row.get(0).unwrap();
        assert_eq!(name, "hello");
    }

    #[tokio::test]
    async fn test_open_local_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dunning.db");

        let db = Database::open("file", Some(path.to_str().unwrap()))
            .await
            .unwrap();
        assert!(db.health_check().await);
        assert!(path.parent().unwrap().is_dir());
    }
}

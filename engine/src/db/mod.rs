/// Database module for SQLite persistence
///
/// Stores encoded link results and the fact sources operations leave behind.
/// The operation engine talks to storage only through the [`ResultStore`] and
/// [`SourceSink`] traits; [`Database`] implements both on top of sqlx with WAL
/// mode, and [`MemoryStore`] implements both in memory.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{Fact, Relationship};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub mod memory;
pub mod results;
pub mod sources;

// Re-export commonly used types
pub use memory::MemoryStore;
pub use results::ResultRepository;
pub use sources::{SourceRepository, SourceSummary};

/// Where link results are written, keyed by link id
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_result(&self, link_id: &str, payload: &str) -> Result<(), EngineError>;

    async fn read_result(&self, link_id: &str) -> Result<Option<String>, EngineError>;
}

/// Receiver of the fact source an operation produces when it closes
#[async_trait]
pub trait SourceSink: Send + Sync {
    async fn persist_source(&self, document: &SourceDocument) -> Result<(), EngineError>;
}

/// Reusable fact source built from an operation's link chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub name: String,
    pub operation_id: String,
    pub facts: Vec<Fact>,
    pub relationships: Vec<Relationship>,
    pub created: DateTime<Utc>,
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode
    /// 3. Run migrations to set up the schema
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations are idempotent and can be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close all connections
    pub async fn close(&self) -> Result<()> {
        info!("Closing database connection");
        self.flush_wal().await?;
        self.pool.close().await;
        Ok(())
    }

    pub fn results(&self) -> ResultRepository {
        ResultRepository::new(self.pool.clone())
    }

    pub fn sources(&self) -> SourceRepository {
        SourceRepository::new(self.pool.clone())
    }
}

#[async_trait]
impl ResultStore for Database {
    async fn save_result(&self, link_id: &str, payload: &str) -> Result<(), EngineError> {
        self.results()
            .save(link_id, payload)
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))
    }

    async fn read_result(&self, link_id: &str) -> Result<Option<String>, EngineError> {
        self.results()
            .get(link_id)
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))
    }
}

#[async_trait]
impl SourceSink for Database {
    async fn persist_source(&self, document: &SourceDocument) -> Result<(), EngineError> {
        self.sources()
            .save(document)
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db_path.exists());

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();

        assert!(tables.contains(&"link_results".to_string()));
        assert!(tables.contains(&"sources".to_string()));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();

        assert_eq!(journal_mode.to_lowercase(), "wal");
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_result_store_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();

        assert_eq!(db.read_result("l1").await.unwrap(), None);
        db.save_result("l1", "first").await.unwrap();
        db.save_result("l1", "second").await.unwrap();
        assert_eq!(db.read_result("l1").await.unwrap().as_deref(), Some("second"));
        db.close().await.unwrap();
    }
}

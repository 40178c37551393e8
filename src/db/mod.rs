//! Database connection and operations
//!
//! The only persistent state is the `processed_media` audit table.

pub mod processed_media;
pub mod sqlite_helpers;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub use processed_media::{
    CreateProcessedMedia, ProcessedMediaRecord, ProcessedMediaRepository,
};

/// Pool size for file-backed stores
const MAX_CONNECTIONS: u32 = 4;

/// Database wrapper providing connection pool access
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the SQLite file and make sure the schema exists
    pub async fn connect(url: &str) -> Result<Self> {
        // Every connection to `:memory:` is its own database
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            MAX_CONNECTIONS
        };

        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL '{}'", url))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        if let Some(parent) = options.get_filename().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }

        // Closing the only connection would drop an in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .with_context(|| format!("Cannot open database '{}'", url))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_media (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_filename TEXT NOT NULL,
                source_fingerprint TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                media_type TEXT NOT NULL,
                season INTEGER,
                episode INTEGER,
                year INTEGER,
                destination_path TEXT NOT NULL,
                processed_date TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create processed_media table")?;

        Ok(())
    }

    /// Get a processed media repository
    pub fn processed_media(&self) -> ProcessedMediaRepository {
        ProcessedMediaRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

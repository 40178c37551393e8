//! Processed media database repository
//!
//! One row per placed source file, keyed by its fingerprint.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{datetime_to_str, int_to_u32, str_to_datetime, u32_to_int};

/// Processed media record from database
#[derive(Debug, Clone)]
pub struct ProcessedMediaRecord {
    pub id: i64,
    pub original_filename: String,
    pub source_fingerprint: String,
    pub title: String,
    pub media_type: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub year: Option<u32>,
    pub destination_path: String,
    pub processed_date: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for ProcessedMediaRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let processed_str: String = row.try_get("processed_date")?;

        Ok(Self {
            id: row.try_get("id")?,
            original_filename: row.try_get("original_filename")?,
            source_fingerprint: row.try_get("source_fingerprint")?,
            title: row.try_get("title")?,
            media_type: row.try_get("media_type")?,
            season: int_to_u32(row.try_get("season")?),
            episode: int_to_u32(row.try_get("episode")?),
            year: int_to_u32(row.try_get("year")?),
            destination_path: row.try_get("destination_path")?,
            processed_date: str_to_datetime(&processed_str)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
        })
    }
}

/// Input for recording a processed file
#[derive(Debug, Clone)]
pub struct CreateProcessedMedia {
    pub original_filename: String,
    pub source_fingerprint: String,
    pub title: String,
    pub media_type: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub year: Option<u32>,
    pub destination_path: String,
    pub processed_date: DateTime<Utc>,
}

/// Processed media repository
pub struct ProcessedMediaRepository {
    pool: SqlitePool,
}

impl ProcessedMediaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether a file version with this fingerprint was already placed
    pub async fn exists_fingerprint(&self, fingerprint: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM processed_media WHERE source_fingerprint = ?1 LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Insert a record. Returns `false` if the fingerprint was already present.
    pub async fn insert(&self, input: CreateProcessedMedia) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_media (
                original_filename, source_fingerprint, title, media_type,
                season, episode, year, destination_path, processed_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&input.original_filename)
        .bind(&input.source_fingerprint)
        .bind(&input.title)
        .bind(&input.media_type)
        .bind(u32_to_int(input.season))
        .bind(u32_to_int(input.episode))
        .bind(u32_to_int(input.year))
        .bind(&input.destination_path)
        .bind(datetime_to_str(input.processed_date))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Most recent records first
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<ProcessedMediaRecord>> {
        let records = sqlx::query_as::<_, ProcessedMediaRecord>(
            r#"
            SELECT id, original_filename, source_fingerprint, title, media_type,
                   season, episode, year, destination_path, processed_date
            FROM processed_media
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_media")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

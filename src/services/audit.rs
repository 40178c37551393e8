//! Audit store seam
//!
//! The pipeline only needs two questions answered: has this file version been
//! placed before, and remember that it has now. [`Database`] answers both.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

use super::filename_parser::{MediaDescriptor, MediaKind};
use super::fingerprint::Fingerprint;
use crate::db::{CreateProcessedMedia, Database};

/// One placed file version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub source_name: String,
    pub fingerprint: Fingerprint,
    pub title: String,
    pub kind: MediaKind,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub year: Option<u32>,
    pub destination_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Build a record for a classified source; `None` for unmatched descriptors
    pub fn new(
        source: &Path,
        fingerprint: Fingerprint,
        descriptor: &MediaDescriptor,
        destination: &Path,
    ) -> Option<Self> {
        let (title, kind, season, episode, year) = match descriptor {
            MediaDescriptor::Episode {
                title,
                season,
                episode,
            } => (title, MediaKind::Tv, Some(*season), Some(*episode), None),
            // Daily shows are filed under a season per air year
            MediaDescriptor::DailyEpisode { title, date } => {
                let year = u32::try_from(date.year()).ok();
                (title, MediaKind::Tv, year, None, year)
            }
            MediaDescriptor::Movie { title, year } => (title, MediaKind::Movie, None, None, *year),
            MediaDescriptor::Unmatched => return None,
        };

        Some(Self {
            source_name: source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            fingerprint,
            title: title.clone(),
            kind,
            season,
            episode,
            year,
            destination_path: destination.to_path_buf(),
            timestamp: Utc::now(),
        })
    }
}

impl From<&AuditRecord> for CreateProcessedMedia {
    fn from(record: &AuditRecord) -> Self {
        Self {
            original_filename: record.source_name.clone(),
            source_fingerprint: record.fingerprint.as_str().to_string(),
            title: record.title.clone(),
            media_type: record.kind.as_str().to_string(),
            season: record.season,
            episode: record.episode,
            year: record.year,
            destination_path: record.destination_path.to_string_lossy().into_owned(),
            processed_date: record.timestamp,
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Returns `false` when the fingerprint was already recorded
    async fn record(&self, record: &AuditRecord) -> Result<bool>;
}

#[async_trait]
impl AuditStore for Database {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.processed_media()
            .exists_fingerprint(fingerprint.as_str())
            .await
    }

    async fn record(&self, record: &AuditRecord) -> Result<bool> {
        self.processed_media().insert(record.into()).await
    }
}

//! Per-file ingestion pipeline
//!
//! One call handles one work item end to end:
//! cheap filters -> audit pre-check -> grace period -> stability ->
//! classification -> placement -> audit record -> notification.
//!
//! Outcomes tell the worker whether the path is finished or should come back
//! through the retry scheduler. Errors are reserved for failures.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::audit::{AuditRecord, AuditStore};
use super::file_utils::{in_sample_dir, is_sample_name, is_temporary_file, is_video_file};
use super::filename_parser::{Classifier, MediaDescriptor};
use super::fingerprint::Fingerprint;
use super::notifications::{Notifier, spawn_notification};
use super::organizer::{Organizer, PlacementOutcome};
use super::queues::WorkItem;
use super::stability::{Stability, StabilityChecker};
use super::worker_pool::ItemHandler;
use crate::config::Config;
use crate::error::{IngestError, Result};

/// Why a file was dropped before classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Missing,
    NotAFile,
    NotVideo,
    Temporary,
    Sample,
    TooSmall,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::NotAFile => "not_a_file",
            Self::NotVideo => "not_video",
            Self::Temporary => "temporary",
            Self::Sample => "sample",
            Self::TooSmall => "too_small",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    /// Modified too recently
    GracePeriod,
    /// Still changing between samples, empty, or vanished while sampling
    Unstable(Stability),
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GracePeriod => f.write_str("grace_period"),
            Self::Unstable(stability) => write!(f, "unstable ({:?})", stability),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Ignored(IgnoreReason),
    /// Fingerprint already in the audit store
    AlreadyProcessed,
    /// No classification pattern matched
    Unmatched,
    Placed(PlacementOutcome),
    NotReady(NotReadyReason),
}

impl ProcessOutcome {
    /// Everything except `NotReady` releases the path
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotReady(_))
    }
}

pub struct FileProcessor {
    watch_root: PathBuf,
    skip_samples: bool,
    min_file_size: u64,
    grace_period: Duration,
    classifier: Classifier,
    stability: StabilityChecker,
    organizer: Arc<Organizer>,
    audit: Arc<dyn AuditStore>,
    notifier: Arc<dyn Notifier>,
}

impl FileProcessor {
    pub fn new(
        config: &Config,
        organizer: Arc<Organizer>,
        audit: Arc<dyn AuditStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            watch_root: config.watch_folder.clone(),
            skip_samples: config.skip_samples,
            min_file_size: config.min_file_size,
            grace_period: config.download_grace_period,
            classifier: Classifier::default().with_daily_shows(&config.daily_shows),
            stability: StabilityChecker::new(config.stability_sample_delay),
            organizer,
            audit,
            notifier,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub async fn process(&self, path: &Path) -> Result<ProcessOutcome> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(self.ignore(path, IgnoreReason::Missing));
            }
            Err(e) => return Err(IngestError::transient(path, e)),
        };

        if !metadata.is_file() {
            return Ok(self.ignore(path, IgnoreReason::NotAFile));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !is_video_file(path) {
            return Ok(self.ignore(path, IgnoreReason::NotVideo));
        }
        if is_temporary_file(&file_name) {
            return Ok(self.ignore(path, IgnoreReason::Temporary));
        }
        if self.skip_samples && (is_sample_name(&file_name) || in_sample_dir(path, &self.watch_root))
        {
            return Ok(self.ignore(path, IgnoreReason::Sample));
        }

        let modified = metadata
            .modified()
            .map_err(|e| IngestError::transient(path, e))?;
        // A modification time in the future counts as recent
        let recently_modified = modified
            .elapsed()
            .map(|age| age < self.grace_period)
            .unwrap_or(true);

        // A download still being written is small; only a settled file is too small
        if metadata.len() < self.min_file_size {
            if recently_modified {
                return Ok(ProcessOutcome::NotReady(NotReadyReason::GracePeriod));
            }
            if metadata.len() == 0 {
                return Ok(ProcessOutcome::NotReady(NotReadyReason::Unstable(
                    Stability::Empty,
                )));
            }
            return Ok(self.ignore(path, IgnoreReason::TooSmall));
        }

        let fingerprint = Fingerprint::compute(&file_name, metadata.len(), modified);
        if self
            .audit
            .exists(&fingerprint)
            .await
            .map_err(|e| store_error(path, e))?
        {
            debug!(path = %path.display(), fingerprint = %fingerprint, "Already processed");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        if recently_modified {
            return Ok(ProcessOutcome::NotReady(NotReadyReason::GracePeriod));
        }

        let stability = self.stability.check(path).await;
        if !stability.is_stable() {
            return Ok(ProcessOutcome::NotReady(NotReadyReason::Unstable(stability)));
        }

        let descriptor = self.classifier.classify(&file_name);
        if descriptor == MediaDescriptor::Unmatched {
            warn!(path = %path.display(), "Could not classify file");
            return Ok(ProcessOutcome::Unmatched);
        }

        let placement = self.organizer.place(path, &descriptor).await?;

        if placement.is_recordable()
            && let Some(record) =
                AuditRecord::new(path, fingerprint, &descriptor, placement.destination())
        {
            let inserted = self
                .audit
                .record(&record)
                .await
                .map_err(|e| store_error(path, e))?;
            if !inserted {
                debug!(path = %path.display(), "Audit record already present");
            }
        }

        if let PlacementOutcome::Placed { destination, .. } = &placement {
            info!(
                path = %path.display(),
                destination = %destination.display(),
                descriptor = ?descriptor,
                "Ingested"
            );
            self.announce(&descriptor);
        }

        Ok(ProcessOutcome::Placed(placement))
    }

    fn ignore(&self, path: &Path, reason: IgnoreReason) -> ProcessOutcome {
        debug!(path = %path.display(), reason = reason.as_str(), "Ignoring file");
        ProcessOutcome::Ignored(reason)
    }

    fn announce(&self, descriptor: &MediaDescriptor) {
        let (Some(title), Some(kind)) = (descriptor.title(), descriptor.kind()) else {
            return;
        };
        let details = match descriptor {
            MediaDescriptor::Episode {
                season, episode, ..
            } => format!("S{:02}E{:02}", season, episode),
            MediaDescriptor::DailyEpisode { date, .. } => date.format("%Y-%m-%d").to_string(),
            MediaDescriptor::Movie {
                year: Some(year), ..
            } => format!("({})", year),
            _ => String::new(),
        };
        spawn_notification(self.notifier.clone(), title.to_string(), kind, details);
    }
}

/// Audit store failures are retried; database errors keep their type
fn store_error(path: &Path, err: anyhow::Error) -> IngestError {
    match err.downcast::<sqlx::Error>() {
        Ok(sql) => IngestError::Store(sql),
        Err(other) => IngestError::WorkerFault {
            path: path.to_path_buf(),
            message: format!("audit store: {:#}", other),
        },
    }
}

#[async_trait]
impl ItemHandler for FileProcessor {
    async fn handle(&self, item: &WorkItem) -> Result<ProcessOutcome> {
        self.process(&item.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::services::notifications::NoopNotifier;
    use assert_matches::assert_matches;
    use std::time::SystemTime;

    struct Fixture {
        _dir: tempfile::TempDir,
        watch: PathBuf,
        config: Config,
        db: Database,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("downloads");
        let media = dir.path().join("media");
        std::fs::create_dir_all(&watch).unwrap();
        std::fs::create_dir_all(&media).unwrap();

        let config = Config {
            watch_folder: watch.clone(),
            media_root: media,
            dry_run: false,
            min_file_size: 4,
            download_grace_period: Duration::from_secs(60),
            stability_sample_delay: Duration::from_millis(5),
            ..Config::default()
        };
        Fixture {
            _dir: dir,
            watch,
            config,
            db: Database::in_memory().await.unwrap(),
        }
    }

    fn processor(f: &Fixture) -> FileProcessor {
        FileProcessor::new(
            &f.config,
            Arc::new(Organizer::new(&f.config)),
            Arc::new(f.db.clone()),
            Arc::new(NoopNotifier),
        )
        .with_classifier(Classifier::new(2026))
    }

    /// Write a file whose mtime is safely outside the grace period
    fn write_aged(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
    }

    #[tokio::test]
    async fn test_filters() {
        let f = fixture().await;
        let p = processor(&f);

        let cases = [
            ("notes.txt", IgnoreReason::NotVideo),
            ("Show.S01E01.mkv.part", IgnoreReason::NotVideo),
            ("Show.S01E01.!qB.mkv", IgnoreReason::Temporary),
            ("Show.S01E01.sample.mkv", IgnoreReason::Sample),
            ("Release/Sample/Show.S01E01.mkv", IgnoreReason::Sample),
        ];
        for (name, reason) in cases {
            let path = f.watch.join(name);
            write_aged(&path, b"big enough");
            assert_eq!(
                p.process(&path).await.unwrap(),
                ProcessOutcome::Ignored(reason),
                "{}",
                name
            );
        }

        let tiny = f.watch.join("Tiny.S01E01.mkv");
        write_aged(&tiny, b"x");
        assert_eq!(
            p.process(&tiny).await.unwrap(),
            ProcessOutcome::Ignored(IgnoreReason::TooSmall)
        );

        assert_eq!(
            p.process(&f.watch.join("gone.mkv")).await.unwrap(),
            ProcessOutcome::Ignored(IgnoreReason::Missing)
        );
    }

    #[tokio::test]
    async fn test_fresh_file_waits_for_grace_period() {
        let f = fixture().await;
        let p = processor(&f);
        let path = f.watch.join("Show.S01E01.mkv");
        std::fs::write(&path, b"episode").unwrap();

        assert_eq!(
            p.process(&path).await.unwrap(),
            ProcessOutcome::NotReady(NotReadyReason::GracePeriod)
        );
        assert!(!p.process(&path).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_small_file_still_downloading_is_retried() {
        let f = fixture().await;
        let p = processor(&f);

        // Created event arrives before the first byte is written
        let fresh = f.watch.join("Show.S01E01.1080p.mkv");
        std::fs::write(&fresh, b"").unwrap();
        let outcome = p.process(&fresh).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NotReady(NotReadyReason::GracePeriod));
        assert!(!outcome.is_terminal());

        let growing = f.watch.join("Show.S01E02.1080p.mkv");
        std::fs::write(&growing, b"x").unwrap();
        assert_eq!(
            p.process(&growing).await.unwrap(),
            ProcessOutcome::NotReady(NotReadyReason::GracePeriod)
        );

        let empty = f.watch.join("Show.S01E03.1080p.mkv");
        write_aged(&empty, b"");
        assert_eq!(
            p.process(&empty).await.unwrap(),
            ProcessOutcome::NotReady(NotReadyReason::Unstable(Stability::Empty))
        );
    }

    #[tokio::test]
    async fn test_unmatched_is_terminal() {
        let f = fixture().await;
        let p = processor(&f);
        let path = f.watch.join("holiday_video.mkv");
        write_aged(&path, b"home movie");

        let outcome = p.process(&path).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unmatched);
        assert!(outcome.is_terminal());
    }

    #[tokio::test]
    async fn test_places_records_and_then_skips() {
        let f = fixture().await;
        let p = processor(&f);
        let path = f.watch.join("Show.S01E02.1080p.WEB.mkv");
        write_aged(&path, b"episode");

        let outcome = p.process(&path).await.unwrap();
        assert_matches!(outcome, ProcessOutcome::Placed(PlacementOutcome::Placed { .. }));
        assert_eq!(f.db.processed_media().count().await.unwrap(), 1);
        assert!(
            f.config
                .tv_root()
                .join("Show/Season 01/Show.S01E02.1080p.mkv")
                .exists()
        );

        assert_eq!(
            p.process(&path).await.unwrap(),
            ProcessOutcome::AlreadyProcessed
        );
        assert_eq!(f.db.processed_media().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let mut f = fixture().await;
        f.config.dry_run = true;
        let p = processor(&f);
        let path = f.watch.join("Film.2019.1080p.mkv");
        write_aged(&path, b"movie");

        assert_matches!(
            p.process(&path).await.unwrap(),
            ProcessOutcome::Placed(PlacementOutcome::DryRun { .. })
        );
        assert_eq!(f.db.processed_media().count().await.unwrap(), 0);
        assert!(!f.config.movie_root().exists());
    }

    #[tokio::test]
    async fn test_handles_work_item() {
        let f = fixture().await;
        let p = processor(&f);
        let item = WorkItem {
            path: f.watch.join("missing.mkv"),
            attempt: 3,
        };
        assert_eq!(
            p.handle(&item).await.unwrap(),
            ProcessOutcome::Ignored(IgnoreReason::Missing)
        );
    }
}

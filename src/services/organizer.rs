//! Media file placement service
//!
//! Places a classified file into the library tree:
//! - TV: "<tv_root>/<Title>/Season 01/<Title.Dots>.S01E01.1080p.mkv"
//! - Daily shows: "<tv_root>/<Title>/Season 2024/<Title.Dots>.2024-01-15.1080p.mkv"
//! - Movies: "<movie_root>/<Title> (2019)/<Title.Dots>.2019.mkv"
//!
//! Files are hard-linked (so the download keeps seeding) into a hidden
//! temporary name and renamed into place. A cross-device link falls back to a
//! copy. Episodes arbitrate quality against files already in the slot; movies
//! only check whether the destination is taken.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::file_utils::{dotted, get_container};
use super::filename_parser::{MediaDescriptor, air_date, explicit_episode};
use super::quality_evaluator::{QualityVerdict, Resolution, compare, quality_score};
use crate::config::Config;
use crate::error::{IngestError, Result};

/// Raw `EXDEV` for platforms where the error kind is not mapped
const EXDEV: i32 = 18;

/// Bound on the upward walk when pruning empty source directories
const MAX_CLEANUP_STEPS: usize = 16;

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMethod {
    Hardlink,
    Copy,
}

impl PlacementMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hardlink => "hardlink",
            Self::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An episode of equal or better quality already fills the slot
    EqualOrBetterExists { existing_score: u32, incoming_score: u32 },
    /// A movie file already sits at the destination
    DestinationExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    Placed {
        destination: PathBuf,
        method: PlacementMethod,
        /// Lower-quality episode files removed to make room
        superseded: Vec<PathBuf>,
    },
    /// The destination is already this very file
    AlreadyLinked { destination: PathBuf },
    /// Left alone; not an error
    Skipped { existing: PathBuf, reason: SkipReason },
    DryRun { destination: PathBuf },
}

impl PlacementOutcome {
    /// Whether the outcome leaves the source represented in the library
    pub fn is_recordable(&self) -> bool {
        matches!(self, Self::Placed { .. } | Self::AlreadyLinked { .. })
    }

    pub fn destination(&self) -> &Path {
        match self {
            Self::Placed { destination, .. }
            | Self::AlreadyLinked { destination }
            | Self::DryRun { destination } => destination,
            Self::Skipped { existing, .. } => existing,
        }
    }
}

/// Where a classified file goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementTarget {
    pub directory: PathBuf,
    pub file_name: String,
    pub quality: u32,
    /// Serializes placements competing for the same slot
    pub lock_key: String,
}

impl PlacementTarget {
    pub fn destination(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

/// The episode a TV file occupies; competing files for a slot are arbitrated by quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeSlot {
    Numbered { season: u32, episode: u32 },
    Aired(NaiveDate),
}

impl EpisodeSlot {
    /// `None` for movies and unmatched files
    pub fn of(descriptor: &MediaDescriptor) -> Option<Self> {
        match descriptor {
            MediaDescriptor::Episode {
                season, episode, ..
            } => Some(Self::Numbered {
                season: *season,
                episode: *episode,
            }),
            MediaDescriptor::DailyEpisode { date, .. } => Some(Self::Aired(*date)),
            MediaDescriptor::Movie { .. } | MediaDescriptor::Unmatched => None,
        }
    }

    /// Whether a file name in the season directory fills this slot
    pub fn is_filled_by(self, file_name: &str) -> bool {
        match self {
            Self::Numbered { season, episode } => {
                explicit_episode(file_name) == Some((season, episode))
            }
            Self::Aired(date) => air_date(file_name) == Some(date),
        }
    }
}

// ============================================================================
// Link strategy
// ============================================================================

/// Hard-link primitive, swappable so tests can simulate a cross-device volume
#[async_trait]
pub trait LinkStrategy: Send + Sync {
    async fn hard_link(&self, source: &Path, destination: &Path) -> io::Result<()>;
}

/// Real filesystem links
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLinker;

#[async_trait]
impl LinkStrategy for FsLinker {
    async fn hard_link(&self, source: &Path, destination: &Path) -> io::Result<()> {
        tokio::fs::hard_link(source, destination).await
    }
}

pub fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices || err.raw_os_error() == Some(EXDEV)
}

// ============================================================================
// Per-destination locks
// ============================================================================

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Async mutex per key; entries disappear once nobody holds or waits on them
#[derive(Default, Clone)]
pub struct KeyedLocks {
    inner: Arc<parking_lot::Mutex<LockMap>>,
}

pub struct KeyedGuard {
    map: Arc<parking_lot::Mutex<LockMap>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut map = self.inner.lock();
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            map: self.inner.clone(),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.map.lock();
        // Only the map itself still references the mutex
        if map
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            map.remove(&self.key);
        }
    }
}

// ============================================================================
// Organizer
// ============================================================================

/// Media file placement service
pub struct Organizer {
    tv_root: PathBuf,
    movie_root: PathBuf,
    watch_root: PathBuf,
    dry_run: bool,
    linker: Arc<dyn LinkStrategy>,
    locks: KeyedLocks,
}

impl Organizer {
    pub fn new(config: &Config) -> Self {
        Self {
            tv_root: config.tv_root(),
            movie_root: config.movie_root(),
            watch_root: config.watch_folder.clone(),
            dry_run: config.dry_run,
            linker: Arc::new(FsLinker),
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_linker(mut self, linker: Arc<dyn LinkStrategy>) -> Self {
        self.linker = linker;
        self
    }

    #[cfg(test)]
    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Compute the destination for a classified file
    pub fn target(&self, source: &Path, descriptor: &MediaDescriptor) -> Option<PlacementTarget> {
        let source_name = source.file_name()?.to_string_lossy();
        let extension = get_container(source)
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();
        let resolution = Resolution::detect(&source_name);
        let quality = resolution.score();
        let resolution_part = resolution
            .tag()
            .map(|tag| format!(".{}", tag))
            .unwrap_or_default();

        match descriptor {
            MediaDescriptor::Episode {
                title,
                season,
                episode,
            } => Some(PlacementTarget {
                directory: self
                    .tv_root
                    .join(title)
                    .join(format!("Season {:02}", season)),
                file_name: format!(
                    "{}.S{:02}E{:02}{}{}",
                    dotted(title),
                    season,
                    episode,
                    resolution_part,
                    extension
                ),
                quality,
                lock_key: format!("tv|{}|{}|{}", title.to_lowercase(), season, episode),
            }),
            MediaDescriptor::DailyEpisode { title, date } => Some(PlacementTarget {
                directory: self
                    .tv_root
                    .join(title)
                    .join(format!("Season {}", date.year())),
                file_name: format!(
                    "{}.{}{}{}",
                    dotted(title),
                    date.format("%Y-%m-%d"),
                    resolution_part,
                    extension
                ),
                quality,
                lock_key: format!("tv|{}|{}", title.to_lowercase(), date),
            }),
            MediaDescriptor::Movie { title, year } => {
                let (folder, file_stem) = match year {
                    Some(year) => (
                        format!("{} ({})", title, year),
                        format!("{}.{}", dotted(title), year),
                    ),
                    None => (title.clone(), dotted(title)),
                };
                Some(PlacementTarget {
                    directory: self.movie_root.join(folder),
                    file_name: format!("{}{}", file_stem, extension),
                    quality,
                    lock_key: format!(
                        "movie|{}|{}",
                        title.to_lowercase(),
                        year.map(|y| y.to_string()).unwrap_or_default()
                    ),
                })
            }
            MediaDescriptor::Unmatched => None,
        }
    }

    /// Place `source` according to `descriptor`
    pub async fn place(
        &self,
        source: &Path,
        descriptor: &MediaDescriptor,
    ) -> Result<PlacementOutcome> {
        let target = self
            .target(source, descriptor)
            .ok_or_else(|| IngestError::ParseFailure(source.display().to_string()))?;
        let destination = target.destination();

        let _slot = self.locks.acquire(&target.lock_key).await;

        if self.dry_run {
            info!(
                source = %source.display(),
                destination = %destination.display(),
                "Dry run: would place file"
            );
            return Ok(PlacementOutcome::DryRun { destination });
        }

        if path_exists(&destination).await && same_file(source, &destination).await {
            debug!(
                source = %source.display(),
                destination = %destination.display(),
                "Destination is already linked to source"
            );
            return Ok(PlacementOutcome::AlreadyLinked { destination });
        }

        let superseded = match EpisodeSlot::of(descriptor) {
            Some(slot) => {
                let existing = self
                    .existing_episode_files(source, &target.directory, slot)
                    .await?;
                if let Some(outcome) = arbitrate(&existing, target.quality) {
                    info!(
                        source = %source.display(),
                        existing = %outcome.destination().display(),
                        incoming_score = target.quality,
                        "Equal or better episode already in place, skipping"
                    );
                    return Ok(outcome);
                }
                existing.into_iter().map(|(path, _)| path).collect()
            }
            None => {
                if path_exists(&destination).await {
                    info!(
                        source = %source.display(),
                        destination = %destination.display(),
                        "Movie destination already exists, skipping"
                    );
                    return Ok(PlacementOutcome::Skipped {
                        existing: destination,
                        reason: SkipReason::DestinationExists,
                    });
                }
                Vec::new()
            }
        };

        tokio::fs::create_dir_all(&target.directory)
            .await
            .map_err(|e| IngestError::transient(&target.directory, e))?;

        for inferior in &superseded {
            tokio::fs::remove_file(inferior)
                .await
                .map_err(|e| IngestError::transient(inferior, e))?;
            info!(
                removed = %inferior.display(),
                incoming = %source.display(),
                "Removed lower quality episode"
            );
        }

        let method = self.link_into_place(source, &target).await?;

        info!(
            source = %source.display(),
            destination = %destination.display(),
            method = method.as_str(),
            "Placed file"
        );

        self.cleanup_empty_ancestors(source).await;

        Ok(PlacementOutcome::Placed {
            destination,
            method,
            superseded,
        })
    }

    /// Files in the season directory occupying the same episode slot, with their scores
    async fn existing_episode_files(
        &self,
        source: &Path,
        directory: &Path,
        slot: EpisodeSlot,
    ) -> Result<Vec<(PathBuf, u32)>> {
        let mut entries = match tokio::fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IngestError::transient(directory, e)),
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IngestError::transient(directory, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Our own temporary artifacts are hidden
            if name.starts_with('.') {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file || !slot.is_filled_by(&name) {
                continue;
            }

            let path = entry.path();
            if same_file(source, &path).await {
                continue;
            }
            matches.push((path, quality_score(&name)));
        }

        Ok(matches)
    }

    /// Hard-link (or copy) into a hidden temporary name, then rename into place
    async fn link_into_place(
        &self,
        source: &Path,
        target: &PlacementTarget,
    ) -> Result<PlacementMethod> {
        let destination = target.destination();
        let temp = target.directory.join(format!(
            ".{}.{}.partial",
            target.file_name,
            Uuid::new_v4().simple()
        ));

        let method = match self.linker.hard_link(source, &temp).await {
            Ok(()) => PlacementMethod::Hardlink,
            Err(e) if is_cross_device(&e) => {
                debug!(
                    source = %source.display(),
                    destination = %destination.display(),
                    "Cross-device link, copying instead"
                );
                if let Err(copy_err) = tokio::fs::copy(source, &temp).await {
                    remove_temp(&temp).await;
                    return Err(IngestError::transient(source, copy_err));
                }
                PlacementMethod::Copy
            }
            Err(e) => {
                remove_temp(&temp).await;
                return Err(IngestError::transient(source, e));
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &destination).await {
            remove_temp(&temp).await;
            return Err(IngestError::transient(&destination, e));
        }

        Ok(method)
    }

    /// Remove now-empty directories above the source, up to the watch root
    async fn cleanup_empty_ancestors(&self, source: &Path) {
        let mut current = source.parent().map(Path::to_path_buf);

        for _ in 0..MAX_CLEANUP_STEPS {
            let Some(dir) = current else { break };
            if dir == self.watch_root || !dir.starts_with(&self.watch_root) {
                break;
            }
            // Fails on a non-empty directory, which ends the walk
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            debug!(directory = %dir.display(), "Removed empty source directory");
            current = dir.parent().map(Path::to_path_buf);
        }
    }
}

/// Better-or-equal survives: the first existing file that is at least as good wins
fn arbitrate(existing: &[(PathBuf, u32)], incoming: u32) -> Option<PlacementOutcome> {
    existing
        .iter()
        .find(|(_, score)| compare(incoming, *score) == QualityVerdict::KeepExisting)
        .map(|(path, score)| PlacementOutcome::Skipped {
            existing: path.clone(),
            reason: SkipReason::EqualOrBetterExists {
                existing_score: *score,
                incoming_score: incoming,
            },
        })
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

async fn remove_temp(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
    }
}

/// Same inode on the same device
#[cfg(unix)]
pub async fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (tokio::fs::metadata(a).await, tokio::fs::metadata(b).await) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub async fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}

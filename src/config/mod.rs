//! Application configuration management
//!
//! Built once at startup and passed by value (or `Arc`) into each component.
//! Nothing reads the environment after [`Config::from_env`] returns.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::IngestError;
use crate::services::filename_parser::DEFAULT_DAILY_SHOWS;

/// How the watch folder is observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Native filesystem notifications
    Notify,
    /// Periodic full-tree scan
    Poll,
}

impl FromStr for WatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "notify" | "inotify" | "native" => Ok(Self::Notify),
            "poll" | "scan" => Ok(Self::Poll),
            other => Err(anyhow::anyhow!("Unknown watch mode '{}'", other)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(anyhow::anyhow!("Unknown log format '{}'", other)),
        }
    }
}

/// Exponential backoff settings shared by every retry in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts at or above this are given up
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Largest exponent applied to the base delay
    pub const MAX_EXPONENT: u32 = 8;

    /// `min(max_delay, base_delay * 2^min(attempt, 8))`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(Self::MAX_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(45),
            max_delay: Duration::from_secs(20_000),
            max_retries: 30,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Staging directory new downloads land in
    pub watch_folder: PathBuf,

    /// Parent of the TV and movie trees
    pub media_root: PathBuf,

    /// TV tree, relative to `media_root`
    pub tv_folder: String,

    /// Movie tree, relative to `media_root`
    pub movie_folder: String,

    /// SQLite path for the audit store
    pub database_path: String,

    /// Log what would happen without touching the filesystem
    pub dry_run: bool,

    /// Files modified more recently than this are not yet eligible
    pub download_grace_period: Duration,

    /// Interval between scans in poll mode
    pub scan_interval: Duration,

    pub watch_mode: WatchMode,

    /// Recurse into subfolders of the watch folder
    pub scan_subfolders: bool,

    /// Depth limit for poll-mode scans (0 = watch folder only)
    pub max_subfolder_depth: usize,

    pub skip_samples: bool,

    /// Shows filed by air date (`Show.2024.01.15`) instead of as movies
    pub daily_shows: Vec<String>,

    /// Files below this size are ignored
    pub min_file_size: u64,

    /// Delay between the two stability samples
    pub stability_sample_delay: Duration,

    /// Worker pool size
    pub workers: usize,

    /// Repeated fresh events for a path inside this window are dropped
    pub dedupe_window: Duration,

    pub retry: RetryPolicy,

    /// How often the retry loop re-checks the head of the delay queue
    pub retry_poll_interval: Duration,

    /// How often service health is logged
    pub health_check_interval: Duration,

    pub enable_telegram: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_folder: PathBuf::from("/media/downloads"),
            media_root: PathBuf::from("/media"),
            tv_folder: "TV".to_string(),
            movie_folder: "Movies".to_string(),
            database_path: "./data/medialink.db".to_string(),
            dry_run: true,
            download_grace_period: Duration::from_secs(120),
            scan_interval: Duration::from_secs(15),
            watch_mode: WatchMode::Notify,
            scan_subfolders: true,
            max_subfolder_depth: 1,
            skip_samples: true,
            daily_shows: DEFAULT_DAILY_SHOWS.iter().map(|t| t.to_string()).collect(),
            min_file_size: 50 * 1024 * 1024,
            stability_sample_delay: Duration::from_millis(500),
            workers: 3,
            dedupe_window: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            retry_poll_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(60),
            enable_telegram: false,
            telegram_bot_token: None,
            telegram_chat_id: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let retry = RetryPolicy {
            base_delay: env_secs("RETRY_BASE")?.unwrap_or(defaults.retry.base_delay),
            max_delay: env_secs("RETRY_MAX")?.unwrap_or(defaults.retry.max_delay),
            max_retries: env_parse("MAX_RETRIES")?.unwrap_or(defaults.retry.max_retries),
        };

        let workers: usize = env_parse("WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            anyhow::bail!("WORKERS must be at least 1");
        }

        Ok(Self {
            watch_folder: env::var("WATCH_FOLDER")
                .map(|p| expand_home(&p))
                .unwrap_or(defaults.watch_folder),

            media_root: env::var("MEDIA_ROOT")
                .map(|p| expand_home(&p))
                .unwrap_or(defaults.media_root),

            tv_folder: env::var("TV_FOLDER").unwrap_or(defaults.tv_folder),

            movie_folder: env::var("MOVIE_FOLDER").unwrap_or(defaults.movie_folder),

            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),

            dry_run: env_bool("DRY_RUN").unwrap_or(defaults.dry_run),

            download_grace_period: env_secs("DOWNLOAD_GRACE_PERIOD")?
                .unwrap_or(defaults.download_grace_period),

            scan_interval: env_secs("SCAN_INTERVAL")?.unwrap_or(defaults.scan_interval),

            watch_mode: env_parse("WATCH_MODE")?.unwrap_or(defaults.watch_mode),

            scan_subfolders: env_bool("SCAN_SUBFOLDERS").unwrap_or(defaults.scan_subfolders),

            max_subfolder_depth: env_parse("MAX_SUBFOLDER_DEPTH")?
                .unwrap_or(defaults.max_subfolder_depth),

            skip_samples: env_bool("SKIP_SAMPLES").unwrap_or(defaults.skip_samples),

            daily_shows: env_nonempty("DAILY_SHOW_TITLES")
                .map(|raw| parse_list(&raw))
                .unwrap_or(defaults.daily_shows),

            min_file_size: env_parse::<u64>("MIN_FILE_SIZE_MB")?
                .map(megabytes)
                .transpose()?
                .unwrap_or(defaults.min_file_size),

            stability_sample_delay: env_parse::<u64>("STABILITY_SAMPLE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.stability_sample_delay),

            workers,

            dedupe_window: env_secs("DEDUPE_WINDOW")?.unwrap_or(defaults.dedupe_window),

            retry,

            retry_poll_interval: env_parse::<u64>("RETRY_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_poll_interval),

            health_check_interval: env_secs("HEALTH_CHECK_INTERVAL")?
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.health_check_interval),

            enable_telegram: env_bool("ENABLE_TELEGRAM").unwrap_or(defaults.enable_telegram),

            telegram_bot_token: env_nonempty("TELEGRAM_BOT_TOKEN"),

            telegram_chat_id: env_nonempty("TELEGRAM_CHAT_ID"),

            log_format: env_parse("LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }

    pub fn tv_root(&self) -> PathBuf {
        self.media_root.join(&self.tv_folder)
    }

    pub fn movie_root(&self) -> PathBuf {
        self.media_root.join(&self.movie_folder)
    }

    /// SQLite connection URL for the audit store
    pub fn database_url(&self) -> String {
        if self.database_path.starts_with("sqlite:") {
            self.database_path.clone()
        } else {
            format!("sqlite://{}", self.database_path)
        }
    }

    /// Telegram credentials, when notifications are enabled and fully configured
    pub fn telegram_credentials(&self) -> Option<(&str, &str)> {
        if !self.enable_telegram {
            return None;
        }
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat)) => Some((token.as_str(), chat.as_str())),
            _ => None,
        }
    }

    /// Check the roots the pipeline cannot run without.
    ///
    /// The watch folder and media root must already exist; the per-kind roots are
    /// created when missing (outside dry-run).
    pub fn validate_roots(&self) -> std::result::Result<(), IngestError> {
        require_dir(&self.watch_folder, "WATCH_FOLDER")?;
        require_dir(&self.media_root, "MEDIA_ROOT")?;

        if !self.dry_run {
            for root in [self.tv_root(), self.movie_root()] {
                std::fs::create_dir_all(&root).map_err(|e| {
                    IngestError::FatalIo(format!("cannot create {}: {}", root.display(), e))
                })?;
            }
        }

        Ok(())
    }
}

fn require_dir(path: &Path, name: &str) -> std::result::Result<(), IngestError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(IngestError::FatalIo(format!(
            "{} missing or not a directory: {}",
            name,
            path.display()
        )))
    }
}

/// Parse a boolean the way the config file always has: 1/true/yes/on
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Comma-separated values, trimmed, empties dropped
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn megabytes(mb: u64) -> Result<u64> {
    mb.checked_mul(1024 * 1024)
        .with_context(|| format!("Invalid MIN_FILE_SIZE_MB: {} MB does not fit in bytes", mb))
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| parse_bool(&v))
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_nonempty(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}", key)),
        None => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

//! Quality evaluation service
//!
//! Scores a file by the resolution marker in its name. The score is only used
//! to decide which of two competing episode files survives.

use std::cmp::Ordering;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

static RESOLUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])(2160p|1080p|720p|480p|4k|uhd)(?:[^a-z0-9]|$)")
        .expect("resolution regex")
});

/// Resolution tier parsed from a filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    Unknown,
    Sd480,
    Hd720,
    Hd1080,
    Uhd2160,
}

impl Resolution {
    /// Ordinal score: 2160 > 1080 > 720 > 480 > 0
    pub fn score(self) -> u32 {
        match self {
            Self::Uhd2160 => 2160,
            Self::Hd1080 => 1080,
            Self::Hd720 => 720,
            Self::Sd480 => 480,
            Self::Unknown => 0,
        }
    }

    /// Canonical tag, as written into placed filenames
    pub fn tag(self) -> Option<&'static str> {
        match self {
            Self::Uhd2160 => Some("2160p"),
            Self::Hd1080 => Some("1080p"),
            Self::Hd720 => Some("720p"),
            Self::Sd480 => Some("480p"),
            Self::Unknown => None,
        }
    }

    /// Detect the resolution marker in a filename
    pub fn detect(filename: &str) -> Self {
        let Some(caps) = RESOLUTION_RE.captures(filename) else {
            return Self::Unknown;
        };
        match caps[1].to_lowercase().as_str() {
            "2160p" | "4k" | "uhd" => Self::Uhd2160,
            "1080p" => Self::Hd1080,
            "720p" => Self::Hd720,
            "480p" => Self::Sd480,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag().unwrap_or("unknown"))
    }
}

/// Quality score of a filename
pub fn quality_score(filename: &str) -> u32 {
    Resolution::detect(filename).score()
}

/// Result of comparing an incoming file against one already in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityVerdict {
    /// Incoming is strictly better: replace the existing file
    Upgrade,
    /// Existing is better or equal: keep it, skip the incoming file
    KeepExisting,
}

/// Better-or-equal survives
pub fn compare(incoming: u32, existing: u32) -> QualityVerdict {
    match incoming.cmp(&existing) {
        Ordering::Greater => QualityVerdict::Upgrade,
        Ordering::Equal | Ordering::Less => QualityVerdict::KeepExisting,
    }
}

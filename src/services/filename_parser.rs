//! Filename parser for scene-style release names
//!
//! Classifies a bare filename as a TV episode, a movie, or nothing at all:
//! - "Chicago Fire S14E08 1080p WEB h264-ETHEL" -> Episode
//! - "Corner.Gas.6x12.720p.mkv" -> Episode
//! - "Some.Movie.Part.2.2026.1080p.mkv" -> Movie (2026)
//! - "The.Daily.Show.2024.01.15.1080p.mkv" -> DailyEpisode (2024-01-15)
//!
//! No I/O happens here. Episode patterns are tried as an ordered cascade of
//! plain functions; the first one that yields a season and episode wins.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::file_utils::{VIDEO_EXTENSIONS, sanitize_title};

// ============================================================================
// Descriptor
// ============================================================================

/// Media category of a classified file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Tv,
    Movie,
}

impl MediaKind {
    /// Value stored in the audit table's `media_type` column
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tv => "TV",
            Self::Movie => "Movie",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDescriptor {
    Episode {
        title: String,
        season: u32,
        episode: u32,
    },
    /// A show filed by air date instead of episode number
    DailyEpisode {
        title: String,
        date: NaiveDate,
    },
    Movie {
        title: String,
        year: Option<u32>,
    },
    Unmatched,
}

impl MediaDescriptor {
    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            Self::Episode { .. } | Self::DailyEpisode { .. } => Some(MediaKind::Tv),
            Self::Movie { .. } => Some(MediaKind::Movie),
            Self::Unmatched => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Episode { title, .. }
            | Self::DailyEpisode { title, .. }
            | Self::Movie { title, .. } => Some(title),
            Self::Unmatched => None,
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

static SEPARATORS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[._\-]+").expect("separator regex"));

/// Release tags, written in separator-normalized form ("web-dl" becomes "web dl")
static TAGS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:2160p|1080p|720p|480p|4k|uhd|web ?dl|web ?rip|web|bluray|brrip|bdrip|hdtv|hdr10|hdr|hevc|x264|x265|h ?264|h ?265|av1|xvid|aac(?:\d(?: \d)?)?|ac3|ddp?(?:\d(?: \d)?)?|dts|atmos|truehd|10bit|8bit|amzn|nf|dsnp|hulu|proper|repack)\b",
    )
    .expect("release tag regex")
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Trailing "(2019)" or "2019" on a show title
static TRAILING_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\(?\b(?:19|20)\d{2}\b\)?\s*$").expect("trailing year regex"));

/// Drop a known video extension. Anything else after the last dot is part of the name.
fn strip_extension(filename: &str) -> &str {
    let path = Path::new(filename);
    let known = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false);

    if known {
        path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename)
    } else {
        filename
    }
}

/// Separators to spaces, without removing tags
fn separators_to_spaces(filename: &str) -> String {
    let spaced = SEPARATORS_RE.replace_all(strip_extension(filename), " ");
    WHITESPACE_RE.replace_all(spaced.trim(), " ").into_owned()
}

/// Normalize a filename for pattern matching.
///
/// Strips the extension, turns `.`, `_` and `-` runs into spaces, removes
/// release tags and collapses whitespace.
pub fn normalize(filename: &str) -> String {
    let spaced = separators_to_spaces(filename);
    let untagged = TAGS_RE.replace_all(&spaced, " ");
    WHITESPACE_RE
        .replace_all(untagged.trim(), " ")
        .into_owned()
}

/// Whitespace-separated tokens with their byte offsets
fn tokens(name: &str) -> impl Iterator<Item = (usize, &str)> {
    name.split(' ')
        .scan(0usize, |offset, token| {
            let start = *offset;
            *offset += token.len() + 1;
            Some((start, token))
        })
        .filter(|(_, token)| !token.is_empty())
}

// ============================================================================
// Episode cascade
// ============================================================================

/// How an episode was written in the name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeMarker {
    /// `S01E02`
    SeasonEpisode,
    /// `1x02`
    Cross,
    /// `102`
    Bare,
}

/// A season/episode hit inside a normalized name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeMatch {
    pub season: u32,
    pub episode: u32,
    pub marker: EpisodeMarker,
    /// Episode number exactly as written ("02" for E02)
    pub episode_digits: String,
    /// Byte offset where the match starts; the title is everything before it
    pub start: usize,
}

type EpisodePattern = fn(&str) -> Option<EpisodeMatch>;

/// Most specific first
const EPISODE_PATTERNS: &[EpisodePattern] = &[match_sxxexx, match_nxnn, match_three_digit];

static SXXEXX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)(S(\d{1,2}) ?E(\d{1,3}))").expect("SxxExx regex")
});

static NXNN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)((\d{1,2})x(\d{2,3}))(?:\s|$)").expect("NxNN regex")
});

fn episode_from_captures(
    caps: &regex::Captures<'_>,
    marker: EpisodeMarker,
) -> Option<EpisodeMatch> {
    let whole = caps.get(1)?;
    let season = caps.get(2)?.as_str().parse().ok()?;
    let episode_digits = caps.get(3)?.as_str();
    let episode = episode_digits.parse().ok()?;

    Some(EpisodeMatch {
        season,
        episode,
        marker,
        episode_digits: episode_digits.to_string(),
        start: whole.start(),
    })
}

/// "Show S01E02", "Show s1 e2"
fn match_sxxexx(name: &str) -> Option<EpisodeMatch> {
    SXXEXX_RE
        .captures(name)
        .and_then(|caps| episode_from_captures(&caps, EpisodeMarker::SeasonEpisode))
}

/// "Show 1x02"
fn match_nxnn(name: &str) -> Option<EpisodeMatch> {
    NXNN_RE
        .captures(name)
        .and_then(|caps| episode_from_captures(&caps, EpisodeMarker::Cross))
}

/// "Show 102" -> season 1, episode 2.
///
/// Only a standalone 3-digit token that follows at least one other token, and
/// never season 0, so "Bond 007" or a bare "300" stay out of it.
fn match_three_digit(name: &str) -> Option<EpisodeMatch> {
    tokens(name)
        .filter(|(start, _)| *start > 0)
        .find_map(|(start, token)| {
            if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let season: u32 = token[..1].parse().ok()?;
            if season == 0 {
                return None;
            }
            let episode_digits = &token[1..];
            Some(EpisodeMatch {
                season,
                episode: episode_digits.parse().ok()?,
                marker: EpisodeMarker::Bare,
                episode_digits: episode_digits.to_string(),
                start,
            })
        })
}

/// Run the cascade; first hit wins
pub fn match_episode(name: &str) -> Option<EpisodeMatch> {
    EPISODE_PATTERNS.iter().find_map(|pattern| pattern(name))
}

/// Season and episode from an explicit marker (`S01E01`, `s1e1`, `1x01`) in a raw filename.
///
/// Used to spot files already occupying an episode slot, where a bare 3-digit
/// number is too weak a signal.
pub fn explicit_episode(filename: &str) -> Option<(u32, u32)> {
    let name = normalize(filename);
    match_sxxexx(&name)
        .or_else(|| match_nxnn(&name))
        .map(|m| (m.season, m.episode))
}

// ============================================================================
// Air date
// ============================================================================

/// Shows filed by air date when no `DAILY_SHOW_TITLES` is configured
pub const DEFAULT_DAILY_SHOWS: &[&str] = &[
    "the daily show",
    "the tonight show starring jimmy fallon",
    "late night with seth meyers",
    "jimmy kimmel live",
    "the late show with stephen colbert",
    "last week tonight with john oliver",
];

/// "2024 01 15" once separators are normalized
static AIR_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)(((?:19|20)\d{2}) (\d{2}) (\d{2}))(?:\s|$)").expect("air date regex")
});

/// A calendar date inside a normalized name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirDateMatch {
    pub date: NaiveDate,
    pub start: usize,
}

/// First valid `YYYY MM DD` in a normalized name
pub fn match_air_date(name: &str) -> Option<AirDateMatch> {
    AIR_DATE_RE.captures_iter(name).find_map(|caps| {
        let whole = caps.get(1)?;
        let date = NaiveDate::from_ymd_opt(
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
            caps[4].parse().ok()?,
        )?;
        Some(AirDateMatch {
            date,
            start: whole.start(),
        })
    })
}

/// Air date in a raw filename (`Show.2024.01.15`, `Show.2024-01-15.1080p.mkv`)
pub fn air_date(filename: &str) -> Option<NaiveDate> {
    match_air_date(&normalize(filename)).map(|m| m.date)
}

// ============================================================================
// Year
// ============================================================================

/// A plausible release year inside a normalized name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearMatch {
    pub year: u32,
    pub digits: String,
    pub start: usize,
}

// ============================================================================
// Classifier
// ============================================================================

/// Episode numbers above this are treated as implausible when a year competes
const MAX_PLAUSIBLE_EPISODE: u32 = 50;

/// Filename classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    current_year: u32,
    /// Lowercase titles of shows filed by air date
    daily_shows: HashSet<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        let current_year = u32::try_from(chrono::Utc::now().year()).unwrap_or(2000);
        Self::new(current_year)
    }
}

impl Classifier {
    pub fn new(current_year: u32) -> Self {
        Self {
            current_year,
            daily_shows: DEFAULT_DAILY_SHOWS.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Replace the shows filed by air date. Matching ignores case.
    pub fn with_daily_shows<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.daily_shows = titles
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    /// Latest year accepted as a release year
    pub fn max_year(&self) -> u32 {
        self.current_year + 2
    }

    /// First 4-digit token in [1900, current_year + 2] with a title before it
    pub fn find_year(&self, name: &str) -> Option<YearMatch> {
        tokens(name).find_map(|(start, token)| {
            let digits = token.trim_matches(|c| matches!(c, '(' | ')' | '[' | ']'));
            if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let year: u32 = digits.parse().ok()?;
            if !(1900..=self.max_year()).contains(&year) || name[..start].trim().is_empty() {
                return None;
            }
            Some(YearMatch {
                year,
                digits: digits.to_string(),
                start,
            })
        })
    }

    /// Date-stamped release of a configured daily show
    fn daily_episode(&self, name: &str) -> Option<MediaDescriptor> {
        let aired = match_air_date(name)?;
        let title = sanitize_title(&name[..aired.start]);
        if title.is_empty() || !self.daily_shows.contains(&title.to_lowercase()) {
            return None;
        }
        Some(MediaDescriptor::DailyEpisode {
            title,
            date: aired.date,
        })
    }

    /// Classify a bare filename
    pub fn classify(&self, filename: &str) -> MediaDescriptor {
        let name = normalize(filename);
        let episode = match_episode(&name);

        // An explicit season/episode marker beats an air date
        let daily = match &episode {
            Some(ep) if ep.marker != EpisodeMarker::Bare => None,
            _ => self.daily_episode(&name),
        };

        let descriptor = match daily {
            Some(daily) => daily,
            None => match (episode, self.find_year(&name)) {
                (Some(ep), Some(year)) if prefers_movie(&ep, &year) => movie(&name, Some(&year)),
                (Some(ep), _) => episode_descriptor(&name, &ep),
                (None, Some(year)) => movie(&name, Some(&year)),
                (None, None) => untitled_movie(filename),
            },
        };

        debug!(filename = %filename, normalized = %name, descriptor = ?descriptor, "Classified filename");
        descriptor
    }
}

/// Year-vs-episode precedence.
///
/// An `S01E02` marker is never overridden. A year that precedes the episode
/// marker belongs to the show title ("Doctor Who 2005 S01E01"), so only a year
/// at or after a `1x02` or `102` marker competes. The movie reading wins when
/// the episode number is implausible or its digits reappear inside the year
/// ("Movie 120 2020").
fn prefers_movie(ep: &EpisodeMatch, year: &YearMatch) -> bool {
    if ep.marker == EpisodeMarker::SeasonEpisode || year.start < ep.start {
        return false;
    }
    ep.episode > MAX_PLAUSIBLE_EPISODE || year.digits.contains(&ep.episode_digits)
}

fn episode_descriptor(name: &str, ep: &EpisodeMatch) -> MediaDescriptor {
    let raw_title = TRAILING_YEAR_RE.replace(name[..ep.start].trim(), "");
    let title = sanitize_title(&raw_title);
    if title.is_empty() {
        return MediaDescriptor::Unmatched;
    }
    MediaDescriptor::Episode {
        title,
        season: ep.season,
        episode: ep.episode,
    }
}

fn movie(name: &str, year: Option<&YearMatch>) -> MediaDescriptor {
    let raw_title = year.map(|y| &name[..y.start]).unwrap_or(name);
    let title = sanitize_title(raw_title);
    if title.is_empty() {
        return MediaDescriptor::Unmatched;
    }
    MediaDescriptor::Movie {
        title,
        year: year.map(|y| y.year),
    }
}

/// A release with quality tags but no year: title is whatever precedes the first tag
fn untitled_movie(filename: &str) -> MediaDescriptor {
    let spaced = separators_to_spaces(filename);
    let Some(tag) = TAGS_RE.find(&spaced) else {
        return MediaDescriptor::Unmatched;
    };
    let title = sanitize_title(&spaced[..tag.start()]);
    if title.is_empty() {
        return MediaDescriptor::Unmatched;
    }
    MediaDescriptor::Movie { title, year: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classifier() -> Classifier {
        Classifier::new(2026)
    }

    fn episode(title: &str, season: u32, episode: u32) -> MediaDescriptor {
        MediaDescriptor::Episode {
            title: title.to_string(),
            season,
            episode,
        }
    }

    fn movie(title: &str, year: Option<u32>) -> MediaDescriptor {
        MediaDescriptor::Movie {
            title: title.to_string(),
            year,
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("Corner.Gas.S06E12.1080p.AMZN.WEB-DL.DDP2.0.H.264-QOQ.mkv"),
            "Corner Gas S06E12 QOQ"
        );
        assert_eq!(normalize("Some_Show__-_1x02.mp4"), "Some Show 1x02");
        // Unknown extensions stay part of the name
        assert_eq!(normalize("Show.S01E01"), "Show S01E01");
    }

    #[test]
    fn test_sxxexx() {
        let c = classifier();
        assert_eq!(
            c.classify("Chicago.Fire.S14E08.1080p.WEB.h264-ETHEL.mkv"),
            episode("Chicago Fire", 14, 8)
        );
        assert_eq!(c.classify("the office s2 e3.mkv"), episode("the office", 2, 3));
        assert_eq!(
            c.classify("Show.S01E01E02.720p.mkv"),
            episode("Show", 1, 1)
        );
    }

    #[test]
    fn test_nxnn() {
        assert_eq!(
            classifier().classify("Corner_Gas_6x12_HDTV.avi"),
            episode("Corner Gas", 6, 12)
        );
    }

    #[test]
    fn test_three_digit() {
        let c = classifier();
        assert_eq!(c.classify("Some.Show.102.HDTV.mkv"), episode("Some Show", 1, 2));
        // Needs a title in front
        assert_eq!(c.classify("102.mkv"), MediaDescriptor::Unmatched);
        // Season 0 is never inferred
        assert_eq!(c.classify("Bond.007.mkv"), MediaDescriptor::Unmatched);
    }

    #[test]
    fn test_codec_digits_are_not_episodes() {
        assert_eq!(
            classifier().classify("Some.Film.H.264.AAC.mkv"),
            movie("Some Film", None)
        );
    }

    #[test]
    fn test_tv_title_drops_trailing_year() {
        let c = classifier();
        assert_eq!(
            c.classify("Doctor.Who.2005.S01E01.720p.mkv"),
            episode("Doctor Who", 1, 1)
        );
        assert_eq!(
            c.classify("Doctor Who (2005) S13E02.mkv"),
            episode("Doctor Who", 13, 2)
        );
    }

    #[test]
    fn test_movie_with_year() {
        let c = classifier();
        assert_eq!(
            c.classify("Some.Movie.Part.2.2026.1080p.mkv"),
            movie("Some Movie Part 2", Some(2026))
        );
        assert_eq!(
            c.classify("The Matrix (1999) 2160p.mkv"),
            movie("The Matrix", Some(1999))
        );
        // 2049 is out of range, so the next token is the year
        assert_eq!(
            c.classify("Blade.Runner.2049.2017.BluRay.mkv"),
            movie("Blade Runner 2049", Some(2017))
        );
        // A year with nothing before it is part of the title
        assert_eq!(
            c.classify("2001.A.Space.Odyssey.1968.mkv"),
            movie("2001 A Space Odyssey", Some(1968))
        );
    }

    #[test]
    fn test_year_range() {
        let c = classifier();
        assert_eq!(c.classify("Future.Film.2028.mkv"), movie("Future Film", Some(2028)));
        assert_eq!(c.classify("Future.Film.2029.mkv"), MediaDescriptor::Unmatched);
        assert_eq!(c.classify("Old.Film.1899.mkv"), MediaDescriptor::Unmatched);
    }

    #[test]
    fn test_precedence_prefers_movie_for_implausible_episode() {
        let c = classifier();
        // Episode digits "20" reappear in the year
        assert_eq!(
            c.classify("The.Movie.120.2020.1080p.mkv"),
            movie("The Movie 120", Some(2020))
        );
        // Episode 60 is implausible
        assert_eq!(c.classify("Film.360.2012.mkv"), movie("Film 360", Some(2012)));
        // Plausible episode with an unrelated year stays an episode
        assert_eq!(
            c.classify("Show.S02E05.2019.mkv"),
            episode("Show", 2, 5)
        );
        // An explicit SxxExx marker always stays an episode
        assert_eq!(
            c.classify("Show.S01E20.2020.1080p.mkv"),
            episode("Show", 1, 20)
        );
        assert_eq!(c.classify("Show.S03E60.2012.mkv"), episode("Show", 3, 60));
    }

    fn daily(title: &str, y: i32, m: u32, d: u32) -> MediaDescriptor {
        MediaDescriptor::DailyEpisode {
            title: title.to_string(),
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
        }
    }

    #[test]
    fn test_daily_show_by_air_date() {
        let c = classifier();
        assert_eq!(
            c.classify("The.Daily.Show.2024.01.15.1080p.WEB.mkv"),
            daily("The Daily Show", 2024, 1, 15)
        );
        assert_eq!(
            c.classify("Jimmy.Kimmel.Live.2024-03-05.Guest.Name.720p.mkv"),
            daily("Jimmy Kimmel Live", 2024, 3, 5)
        );
        // Not a known daily show: the date reads as a movie year
        assert_eq!(
            c.classify("Some.Show.2024.01.15.1080p.mkv"),
            movie("Some Show", Some(2024))
        );
        // Explicit markers win over the date
        assert_eq!(
            c.classify("The.Daily.Show.S29E10.2024.01.15.mkv"),
            episode("The Daily Show", 29, 10)
        );
        // Impossible dates are not air dates
        assert_eq!(
            c.classify("The.Daily.Show.2024.13.40.mkv"),
            movie("The Daily Show", Some(2024))
        );
    }

    #[test]
    fn test_daily_shows_are_configurable() {
        let c = classifier().with_daily_shows(["  Nightly News ", ""]);
        assert_eq!(
            c.classify("Nightly.News.2025.02.03.mkv"),
            daily("Nightly News", 2025, 2, 3)
        );
        assert_eq!(
            c.classify("The.Daily.Show.2024.01.15.mkv"),
            movie("The Daily Show", Some(2024))
        );
    }

    #[test]
    fn test_air_date() {
        assert_eq!(
            air_date("The.Daily.Show.2024-01-15.1080p.mkv"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(air_date("Show.S01E01.mkv"), None);
    }

    #[test]
    fn test_yearless_movie_needs_a_tag() {
        let c = classifier();
        assert_eq!(
            c.classify("Orphan.Movie.1080p.WEB.mkv"),
            movie("Orphan Movie", None)
        );
        assert_eq!(c.classify("holiday_video.mp4"), MediaDescriptor::Unmatched);
    }

    #[test]
    fn test_empty_title_is_unmatched() {
        let c = classifier();
        assert_eq!(c.classify("S01E01.mkv"), MediaDescriptor::Unmatched);
        assert_eq!(c.classify("1080p.mkv"), MediaDescriptor::Unmatched);
    }

    #[test]
    fn test_titles_are_sanitized() {
        assert_eq!(
            classifier().classify("What If?.S01E01.mkv"),
            episode("What If", 1, 1)
        );
    }

    #[test]
    fn test_explicit_episode() {
        assert_eq!(explicit_episode("Show.S01E02.720p.mkv"), Some((1, 2)));
        assert_eq!(explicit_episode("Show - 1x02.mkv"), Some((1, 2)));
        assert_eq!(explicit_episode("Show.102.mkv"), None);
    }

    #[test]
    fn test_descriptor_kind() {
        assert_eq!(episode("A", 1, 1).kind(), Some(MediaKind::Tv));
        assert_eq!(movie("A", None).kind(), Some(MediaKind::Movie));
        assert_eq!(MediaDescriptor::Unmatched.kind(), None);
        assert_eq!(MediaKind::Tv.as_str(), "TV");
    }
}

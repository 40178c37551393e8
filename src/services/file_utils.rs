//! Shared file utility functions
//!
//! Extension checks, partial-download detection, sample detection and title
//! sanitizing used across the pipeline.

use std::path::Path;

/// Video file extensions (lowercase, without the dot)
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "m4v", "webm", "ts", "m2ts", "wmv",
];

/// Suffixes download clients use for files still being written
pub const TEMP_PARTIAL_SUFFIXES: &[&str] = &[
    ".part",
    ".crdownload",
    ".!ut",
    ".!qb",
    ".aria2",
    ".partial",
];

/// Directory names that only ever hold sample clips
pub const SAMPLE_DIR_NAMES: &[&str] = &["sample", "samples"];

/// Check if a file is a video file based on extension
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether the filename marks a partial download.
///
/// qBittorrent may put `.!qB` in the middle (`video.!qB.mkv`), so that token is
/// matched anywhere; the rest are suffix checks.
pub fn is_temporary_file(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    if lower.contains(".!qb") {
        return true;
    }
    TEMP_PARTIAL_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Whether the filename itself looks like a sample clip
pub fn is_sample_name(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    let stem = Path::new(&lower)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&lower)
        .to_string();

    stem == "sample"
        || stem
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "sample")
}

pub fn is_sample_dir(name: &str) -> bool {
    SAMPLE_DIR_NAMES.contains(&name.to_lowercase().as_str())
}

/// Whether `path` sits inside a sample directory somewhere below `root`
pub fn in_sample_dir(path: &Path, root: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    relative
        .parent()
        .map(|dir| {
            dir.components()
                .filter_map(|c| c.as_os_str().to_str())
                .any(is_sample_dir)
        })
        .unwrap_or(false)
}

/// Characters no filesystem we target accepts in a name
const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Clean a title for use as a directory or file name.
///
/// Removes unsafe characters, collapses whitespace and trims punctuation from
/// both ends. May return an empty string.
pub fn sanitize_title(name: &str) -> String {
    let without_unsafe: String = name.chars().filter(|c| !UNSAFE_CHARS.contains(c)).collect();
    let sanitized = sanitize_filename::sanitize(without_unsafe);
    let collapsed = sanitized.split_whitespace().collect::<Vec<_>>().join(" ");

    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

/// "Some Show Name" -> "Some.Show.Name"
pub fn dotted(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(".")
}

/// Lowercase extension without the dot
pub fn get_container(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
}

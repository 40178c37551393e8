//! Stability checker
//!
//! Decides whether a file is still being written by sampling its size and
//! modification time twice with a short gap. It is a heuristic: a download
//! paused for longer than the gap looks finished.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stable,
    /// Size or modification time moved between samples
    Changing,
    /// Gone before or during sampling
    Missing,
    /// Zero bytes on both samples
    Empty,
}

impl Stability {
    pub fn is_stable(self) -> bool {
        self == Self::Stable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    size: u64,
    modified: Option<SystemTime>,
}

async fn sample(path: &Path) -> Option<Sample> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some(Sample {
        size: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct StabilityChecker {
    sample_delay: Duration,
}

impl StabilityChecker {
    pub fn new(sample_delay: Duration) -> Self {
        Self { sample_delay }
    }

    pub async fn check(&self, path: &Path) -> Stability {
        let Some(first) = sample(path).await else {
            return Stability::Missing;
        };
        tokio::time::sleep(self.sample_delay).await;
        let Some(second) = sample(path).await else {
            return Stability::Missing;
        };

        let result = if first != second {
            Stability::Changing
        } else if second.size == 0 {
            Stability::Empty
        } else {
            Stability::Stable
        };

        debug!(
            path = %path.display(),
            first_size = first.size,
            second_size = second.size,
            result = ?result,
            "Stability sampled"
        );
        result
    }
}

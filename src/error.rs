//! Error taxonomy for the ingestion pipeline

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// File still changing, or a filesystem call that may succeed later
    #[error("transient I/O error on {}: {source}", path.display())]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No classification pattern matched the filename
    #[error("could not classify '{0}'")]
    ParseFailure(String),

    /// Startup precondition failed (missing roots, unreachable store)
    #[error("fatal: {0}")]
    FatalIo(String),

    /// Unexpected failure caught at the worker boundary
    #[error("worker fault on {}: {message}", path.display())]
    WorkerFault { path: PathBuf, message: String },

    #[error("audit store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl IngestError {
    pub fn transient(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::TransientIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure should go back through the retry scheduler
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ParseFailure(_) | Self::FatalIo(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

//! medialink: watches a download folder and files finished media into a
//! TV/Movies library by hardlink (or copy across filesystems).

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::Config;
pub use error::{IngestError, Result};

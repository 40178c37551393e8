//! Minimal CLI parsing for startup overrides.

use std::env;
use std::path::PathBuf;

use crate::config::{Config, WatchMode};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliOptions {
    /// Env file loaded instead of `.env`
    pub config_file: Option<PathBuf>,
    pub dry_run: bool,
    pub poll: bool,
    pub help: bool,
}

impl CliOptions {
    pub fn from_args() -> Self {
        Self::parse(env::args().skip(1))
    }

    pub fn parse<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut options = CliOptions::default();
        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--dry-run" => options.dry_run = true,
                "--poll" => options.poll = true,
                "-h" | "--help" => options.help = true,
                "--config" => {
                    if let Some(value) = args.next() {
                        options.config_file = Some(PathBuf::from(value));
                    }
                }
                _ if arg.starts_with("--config=") => {
                    if let Some(value) = arg.split_once('=').map(|(_, v)| v) {
                        options.config_file = Some(PathBuf::from(value));
                    }
                }
                _ => {}
            }
        }
        options
    }

    /// Flags override whatever the environment said
    pub fn apply(&self, config: &mut Config) {
        if self.dry_run {
            config.dry_run = true;
        }
        if self.poll {
            config.watch_mode = WatchMode::Poll;
        }
    }
}

pub const USAGE: &str = "\
Usage: medialink [--config <env-file>] [--dry-run] [--poll]

  --config <file>  load settings from this env file instead of .env
  --dry-run        compute destinations without touching the filesystem
  --poll           scan the watch folder on a timer instead of using notifications";

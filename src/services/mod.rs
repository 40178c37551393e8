//! Ingestion pipeline components and the services that run them

pub mod audit;
pub mod file_processor;
pub mod file_utils;
pub mod filename_parser;
pub mod fingerprint;
pub mod ingest;
pub mod logging;
pub mod manager;
pub mod notifications;
pub mod organizer;
pub mod quality_evaluator;
pub mod queues;
pub mod stability;
pub mod watcher;
pub mod worker_pool;

pub use audit::{AuditRecord, AuditStore};
pub use file_processor::{FileProcessor, IgnoreReason, NotReadyReason, ProcessOutcome};
pub use filename_parser::{Classifier, MediaDescriptor, MediaKind};
pub use fingerprint::Fingerprint;
pub use ingest::IngestService;
pub use logging::init_tracing;
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager};
pub use notifications::{NoopNotifier, Notifier, TelegramNotifier};
pub use organizer::{
    FsLinker, LinkStrategy, Organizer, PlacementMethod, PlacementOutcome, PlacementTarget,
    SkipReason,
};
pub use quality_evaluator::{QualityVerdict, Resolution, quality_score};
pub use queues::{Dispatcher, RetryScheduler, ScheduleOutcome, SubmitOutcome, WorkItem};
pub use stability::{Stability, StabilityChecker};
pub use watcher::{NotifyWatcher, PollScanner, WatchEvent, WatchEventKind, WatcherService};
pub use worker_pool::{ItemHandler, WorkerPool};

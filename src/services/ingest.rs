//! Ingestion service: dispatcher, retry loop and worker pool as one unit
//!
//! The dispatcher exists from construction so the watcher can be handed a
//! clone before anything starts. Starting spawns the retry loop and the
//! workers. Stopping cancels the workers first and waits for each to finish
//! the item it holds, then stops the retry loop so any retry those items
//! armed is discarded and its path released.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::audit::AuditStore;
use super::file_processor::FileProcessor;
use super::manager::{Service, ServiceHealth};
use super::notifications;
use super::organizer::Organizer;
use super::queues::{Dispatcher, RetryScheduler, SubmitOutcome};
use super::worker_pool::{ItemHandler, WorkerPool};
use crate::config::Config;

struct IngestRuntime {
    workers_cancel: CancellationToken,
    retry_cancel: CancellationToken,
    retry_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl IngestRuntime {
    async fn shutdown(self) {
        self.workers_cancel.cancel();
        for handle in self.worker_handles {
            let _ = handle.await;
        }
        // Workers are gone, nothing can arm a retry past this drain
        self.retry_cancel.cancel();
        let _ = self.retry_handle.await;
    }
}

pub struct IngestService {
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
    pool: WorkerPool,
    workers: usize,
    runtime: RwLock<Option<IngestRuntime>>,
}

impl IngestService {
    /// Wire the pipeline around any item handler
    pub fn new(config: &Config, handler: Arc<dyn ItemHandler>) -> Self {
        let (dispatcher, receiver) = Dispatcher::new(config.dedupe_window);
        let scheduler =
            RetryScheduler::new(dispatcher.clone(), config.retry, config.retry_poll_interval);
        let pool = WorkerPool::new(
            handler,
            dispatcher.clone(),
            scheduler.clone(),
            receiver,
            config.workers,
        );

        Self {
            dispatcher,
            scheduler,
            pool,
            workers: config.workers.max(1),
            runtime: RwLock::new(None),
        }
    }

    /// The full file pipeline backed by `audit`, with the notifier chosen from config
    pub fn from_config(config: &Config, audit: Arc<dyn AuditStore>) -> Self {
        let organizer = Arc::new(Organizer::new(config));
        let notifier = notifications::from_config(config);
        let processor = FileProcessor::new(config, organizer, audit, notifier);
        Self::new(config, Arc::new(processor))
    }

    /// Handle for event sources
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Submit a path directly, bypassing any event source
    pub fn submit(&self, path: &Path) -> SubmitOutcome {
        self.dispatcher.submit(path)
    }
}

#[async_trait]
impl Service for IngestService {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.write().await;
        if runtime.is_some() {
            return Ok(());
        }

        let retry_cancel = CancellationToken::new();
        let retry_handle = {
            let scheduler = self.scheduler.clone();
            let cancel = retry_cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };
        let workers_cancel = CancellationToken::new();
        let worker_handles = self.pool.spawn(workers_cancel.clone());

        info!(service = "ingest", workers = self.workers, "Ingest pipeline started");
        *runtime = Some(IngestRuntime {
            workers_cancel,
            retry_cancel,
            retry_handle,
            worker_handles,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(runtime) = self.runtime.write().await.take() {
            info!(
                service = "ingest",
                queued = self.dispatcher.queued(),
                pending_retries = self.scheduler.pending(),
                "Stopping ingest pipeline"
            );
            runtime.shutdown().await;
            info!(
                service = "ingest",
                abandoned = self.dispatcher.in_flight_count(),
                "Ingest pipeline stopped"
            );
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        let runtime = self.runtime.read().await;
        let Some(runtime) = runtime.as_ref() else {
            return Ok(ServiceHealth::degraded("not started"));
        };

        let alive = runtime
            .worker_handles
            .iter()
            .filter(|h| !h.is_finished())
            .count();
        if runtime.retry_handle.is_finished() {
            Ok(ServiceHealth::unhealthy("retry scheduler exited"))
        } else if alive < self.workers {
            Ok(ServiceHealth::degraded(format!(
                "{} of {} workers running",
                alive, self.workers
            )))
        } else {
            Ok(ServiceHealth::healthy())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as IngestResult;
    use crate::services::file_processor::{NotReadyReason, ProcessOutcome};
    use crate::services::manager::HealthStatus;
    use crate::services::queues::WorkItem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ItemHandler for Counting {
        async fn handle(&self, _item: &WorkItem) -> IngestResult<ProcessOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessOutcome::Unmatched)
        }
    }

    /// Holds each item for a while, then asks for a retry
    struct SlowNotReady {
        started: AtomicUsize,
    }

    #[async_trait]
    impl ItemHandler for SlowNotReady {
        async fn handle(&self, _item: &WorkItem) -> IngestResult<ProcessOutcome> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(ProcessOutcome::NotReady(NotReadyReason::GracePeriod))
        }
    }

    #[tokio::test]
    async fn test_stop_releases_retry_armed_by_finishing_worker() {
        let handler = Arc::new(SlowNotReady {
            started: AtomicUsize::new(0),
        });
        let config = Config {
            workers: 1,
            ..Config::default()
        };
        let service = IngestService::new(&config, handler.clone());
        service.start().await.unwrap();

        let path = Path::new("/downloads/partial.mkv");
        assert_eq!(service.submit(path), SubmitOutcome::Queued);
        for _ in 0..200 {
            if handler.started.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.started.load(Ordering::SeqCst), 1);

        // The worker is mid-item; its retry lands after cancellation
        service.stop().await.unwrap();

        assert_eq!(service.scheduler.pending(), 0);
        assert!(!service.dispatcher().is_in_flight(path));
        assert_eq!(service.dispatcher().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_start_process_stop() {
        let handler = Arc::new(Counting::default());
        let config = Config {
            workers: 2,
            ..Config::default()
        };
        let service = IngestService::new(&config, handler.clone());
        assert_eq!(service.health().await.unwrap().status, HealthStatus::Degraded);

        service.start().await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.health().await.unwrap().status, HealthStatus::Healthy);

        assert_eq!(service.submit(Path::new("/downloads/a.mkv")), SubmitOutcome::Queued);
        for _ in 0..200 {
            if service.dispatcher().in_flight_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        service.stop().await.unwrap();
        service.stop().await.unwrap();
        assert_eq!(service.health().await.unwrap().status, HealthStatus::Degraded);
    }
}

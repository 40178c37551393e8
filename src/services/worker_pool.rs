//! Worker pool draining the work queue
//!
//! N workers pull items from the shared queue. Each item runs in its own task
//! so a panic is caught at the join boundary and turned into a retry instead
//! of taking the worker down. On cancellation a worker finishes the item it
//! holds, then exits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::file_processor::ProcessOutcome;
use super::queues::{Dispatcher, RetryScheduler, ScheduleOutcome, WorkItem};
use crate::error::{IngestError, Result};

/// Processes one work item
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    async fn handle(&self, item: &WorkItem) -> Result<ProcessOutcome>;
}

pub struct WorkerPool {
    handler: Arc<dyn ItemHandler>,
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
    receiver: flume::Receiver<WorkItem>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(
        handler: Arc<dyn ItemHandler>,
        dispatcher: Dispatcher,
        scheduler: RetryScheduler,
        receiver: flume::Receiver<WorkItem>,
        workers: usize,
    ) -> Self {
        Self {
            handler,
            dispatcher,
            scheduler,
            receiver,
            workers: workers.max(1),
        }
    }

    /// Start the workers; they stop when `cancel` fires
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    handler: self.handler.clone(),
                    dispatcher: self.dispatcher.clone(),
                    scheduler: self.scheduler.clone(),
                    receiver: self.receiver.clone(),
                };
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    handler: Arc<dyn ItemHandler>,
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
    receiver: flume::Receiver<WorkItem>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        debug!(worker = self.id, "Worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.receiver.recv_async() => match received {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };
            self.process(item).await;
        }

        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, item: WorkItem) {
        debug!(
            worker = self.id,
            path = %item.path.display(),
            attempt = item.attempt,
            "Processing"
        );

        let handler = self.handler.clone();
        let task_item = item.clone();
        let result = match tokio::spawn(async move { handler.handle(&task_item).await }).await {
            Ok(result) => result,
            Err(join_error) => Err(IngestError::WorkerFault {
                path: item.path.clone(),
                message: join_error.to_string(),
            }),
        };

        match result {
            Ok(ProcessOutcome::NotReady(reason)) => {
                debug!(
                    worker = self.id,
                    path = %item.path.display(),
                    detail = %reason,
                    "File not ready"
                );
                self.retry(&item, "not_ready");
            }
            Ok(outcome) => {
                self.dispatcher.complete(&item.path);
                debug!(
                    worker = self.id,
                    path = %item.path.display(),
                    outcome = ?outcome,
                    "Done"
                );
            }
            Err(e @ IngestError::WorkerFault { .. }) => {
                error!(worker = self.id, path = %item.path.display(), error = %e, "Worker fault");
                self.retry(&item, "failure");
            }
            Err(e) if e.is_transient() => {
                warn!(worker = self.id, path = %item.path.display(), error = %e, "Transient failure");
                self.retry(&item, "failure");
            }
            Err(e) => {
                warn!(worker = self.id, path = %item.path.display(), error = %e, "Dropping file");
                self.dispatcher.complete(&item.path);
            }
        }
    }

    fn retry(&self, item: &WorkItem, reason: &'static str) {
        let next = item.attempt.saturating_add(1);
        if let ScheduleOutcome::Scheduled { delay } = self.scheduler.schedule(&item.path, next) {
            info!(
                worker = self.id,
                path = %item.path.display(),
                attempt = next,
                delay_secs = delay.as_secs(),
                reason,
                "Will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::services::file_processor::NotReadyReason;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks concurrent handling per path
    #[derive(Default)]
    struct CountingHandler {
        active: Mutex<HashMap<PathBuf, usize>>,
        max_concurrent_same_path: AtomicUsize,
        calls: AtomicUsize,
        not_ready_first: bool,
    }

    #[async_trait]
    impl ItemHandler for CountingHandler {
        async fn handle(&self, item: &WorkItem) -> Result<ProcessOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = {
                let mut active = self.active.lock();
                let count = active.entry(item.path.clone()).or_default();
                *count += 1;
                *count
            };
            self.max_concurrent_same_path
                .fetch_max(now_active, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(10)).await;
            *self.active.lock().get_mut(&item.path).unwrap() -= 1;

            if self.not_ready_first && item.attempt == 0 {
                return Ok(ProcessOutcome::NotReady(NotReadyReason::GracePeriod));
            }
            Ok(ProcessOutcome::Unmatched)
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl ItemHandler for PanickingHandler {
        async fn handle(&self, _item: &WorkItem) -> Result<ProcessOutcome> {
            panic!("boom");
        }
    }

    struct FailingHandler {
        transient: bool,
    }

    #[async_trait]
    impl ItemHandler for FailingHandler {
        async fn handle(&self, item: &WorkItem) -> Result<ProcessOutcome> {
            if self.transient {
                Err(IngestError::transient(&item.path, std::io::Error::other("busy")))
            } else {
                Err(IngestError::ParseFailure(item.path.display().to_string()))
            }
        }
    }

    fn setup(
        handler: Arc<dyn ItemHandler>,
        workers: usize,
    ) -> (Dispatcher, RetryScheduler, WorkerPool) {
        let (dispatcher, rx) = Dispatcher::new(Duration::ZERO);
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            max_retries: 2,
        };
        let scheduler = RetryScheduler::new(dispatcher.clone(), policy, Duration::from_millis(100));
        let pool = WorkerPool::new(handler, dispatcher.clone(), scheduler.clone(), rx, workers);
        (dispatcher, scheduler, pool)
    }

    async fn wait_until_idle(dispatcher: &Dispatcher) {
        for _ in 0..500 {
            if dispatcher.in_flight_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline did not drain");
    }

    #[tokio::test]
    async fn test_event_storm_never_double_processes() {
        let handler = Arc::new(CountingHandler::default());
        let (dispatcher, _scheduler, pool) = setup(handler.clone(), 4);
        let cancel = CancellationToken::new();
        let workers = pool.spawn(cancel.clone());

        let path = Path::new("/downloads/storm.mkv");
        for _ in 0..200 {
            dispatcher.submit(path);
            tokio::task::yield_now().await;
        }
        wait_until_idle(&dispatcher).await;

        assert_eq!(handler.max_concurrent_same_path.load(Ordering::SeqCst), 1);
        assert!(handler.calls.load(Ordering::SeqCst) >= 1);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_goes_through_retry() {
        let handler = Arc::new(CountingHandler {
            not_ready_first: true,
            ..Default::default()
        });
        let (dispatcher, scheduler, pool) = setup(handler.clone(), 2);
        let cancel = CancellationToken::new();
        let workers = pool.spawn(cancel.clone());
        let retry_loop = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        let path = Path::new("/downloads/slow.mkv");
        dispatcher.submit(path);
        wait_until_idle(&dispatcher).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        retry_loop.await.unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_retried_then_given_up() {
        let (dispatcher, scheduler, pool) = setup(Arc::new(PanickingHandler), 1);
        let cancel = CancellationToken::new();
        let workers = pool.spawn(cancel.clone());
        let retry_loop = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        let path = Path::new("/downloads/cursed.mkv");
        dispatcher.submit(path);
        wait_until_idle(&dispatcher).await;

        // Attempts 0 and 1 panicked, attempt 2 hit the ceiling
        assert!(!dispatcher.is_in_flight(path));
        assert_eq!(scheduler.pending(), 0);

        cancel.cancel();
        retry_loop.await.unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_error_kinds() {
        let (dispatcher, scheduler, pool) = setup(Arc::new(FailingHandler { transient: false }), 1);
        let cancel = CancellationToken::new();
        let workers = pool.spawn(cancel.clone());

        dispatcher.submit(Path::new("/downloads/a.mkv"));
        wait_until_idle(&dispatcher).await;
        assert_eq!(scheduler.pending(), 0);
        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }

        let (dispatcher, scheduler, pool) = setup(Arc::new(FailingHandler { transient: true }), 1);
        let cancel = CancellationToken::new();
        let workers = pool.spawn(cancel.clone());

        let path = Path::new("/downloads/b.mkv");
        dispatcher.submit(path);
        for _ in 0..100 {
            if scheduler.pending() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Transient failures stay in flight with a retry armed
        assert_eq!(scheduler.pending(), 1);
        assert!(dispatcher.is_in_flight(path));

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}

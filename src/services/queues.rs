//! Work dispatch and retry scheduling
//!
//! The [`Dispatcher`] turns raw change events into work items, suppressing
//! repeats inside the dedupe window and keeping at most one item per path
//! queued or executing. The [`RetryScheduler`] holds failed or not-yet-ready
//! paths in a delay queue and hands them back with exponential backoff.
//!
//! Both share one lock over the in-flight set, the delay queue and the
//! last-submitted map, so a path cannot be marked done by a worker while a
//! stale retry for it is being re-armed.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RetryPolicy;

/// Prune the last-submitted map once it grows past this
const LAST_SUBMITTED_PRUNE_THRESHOLD: usize = 1024;

/// A path waiting for (or being handled by) a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    /// 0 for a fresh event, N for the Nth retry
    pub attempt: u32,
}

/// A delayed re-submission, ordered by due time
#[derive(Debug, Clone, PartialEq, Eq)]
struct RetryEntry {
    due: Instant,
    path: PathBuf,
    attempt: u32,
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.path.cmp(&other.path))
            .then_with(|| self.attempt.cmp(&other.attempt))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    inflight: HashSet<PathBuf>,
    delay: BinaryHeap<Reverse<RetryEntry>>,
    last_submitted: HashMap<PathBuf, Instant>,
}

/// What happened to a fresh submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Same path submitted within the dedupe window
    Deduplicated,
    /// Path already queued or executing
    AlreadyInFlight,
    /// Work queue receiver is gone (shutting down)
    Closed,
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<DispatchState>>,
    tx: flume::Sender<WorkItem>,
    dedupe_window: Duration,
}

impl Dispatcher {
    /// Create the dispatcher and the receiving end of its work queue
    pub fn new(dedupe_window: Duration) -> (Self, flume::Receiver<WorkItem>) {
        let (tx, rx) = flume::unbounded();
        let dispatcher = Self {
            state: Arc::new(Mutex::new(DispatchState::default())),
            tx,
            dedupe_window,
        };
        (dispatcher, rx)
    }

    /// Submit a path seen by an event source
    pub fn submit(&self, path: &Path) -> SubmitOutcome {
        self.submit_at(path, Instant::now())
    }

    pub fn submit_at(&self, path: &Path, now: Instant) -> SubmitOutcome {
        let mut state = self.state.lock();

        if let Some(last) = state.last_submitted.get(path)
            && now.saturating_duration_since(*last) < self.dedupe_window
        {
            debug!(path = %path.display(), "Duplicate event inside dedupe window");
            return SubmitOutcome::Deduplicated;
        }
        state.last_submitted.insert(path.to_path_buf(), now);
        if state.last_submitted.len() > LAST_SUBMITTED_PRUNE_THRESHOLD {
            let window = self.dedupe_window;
            state
                .last_submitted
                .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        }

        if state.inflight.contains(path) {
            debug!(path = %path.display(), "Path already in flight");
            return SubmitOutcome::AlreadyInFlight;
        }

        state.inflight.insert(path.to_path_buf());
        let item = WorkItem {
            path: path.to_path_buf(),
            attempt: 0,
        };
        if self.tx.send(item).is_err() {
            state.inflight.remove(path);
            return SubmitOutcome::Closed;
        }

        debug!(path = %path.display(), "Queued");
        SubmitOutcome::Queued
    }

    /// Terminal outcome: release the path. Returns `false` if it was not in flight.
    pub fn complete(&self, path: &Path) -> bool {
        self.state.lock().inflight.remove(path)
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.state.lock().inflight.contains(path)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Items waiting in the work queue
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

// ============================================================================
// Retry scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { delay: Duration },
    /// Retry ceiling reached; the path was released
    GaveUp,
}

#[derive(Clone)]
pub struct RetryScheduler {
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl RetryScheduler {
    pub fn new(dispatcher: Dispatcher, policy: RetryPolicy, poll_interval: Duration) -> Self {
        Self {
            dispatcher,
            policy,
            poll_interval,
        }
    }

    /// Arm a retry for an in-flight path, or give up past the ceiling
    pub fn schedule(&self, path: &Path, attempt: u32) -> ScheduleOutcome {
        self.schedule_at(path, attempt, Instant::now())
    }

    pub fn schedule_at(&self, path: &Path, attempt: u32, now: Instant) -> ScheduleOutcome {
        let mut state = self.dispatcher.state.lock();

        if self.policy.exhausted(attempt) {
            state.inflight.remove(path);
            error!(
                path = %path.display(),
                attempt,
                max_retries = self.policy.max_retries,
                "Giving up after too many retries"
            );
            return ScheduleOutcome::GaveUp;
        }

        let delay = self.policy.delay(attempt);
        state.delay.push(Reverse(RetryEntry {
            due: now + delay,
            path: path.to_path_buf(),
            attempt,
        }));

        info!(
            path = %path.display(),
            attempt,
            delay_secs = delay.as_secs(),
            "Retry scheduled"
        );
        ScheduleOutcome::Scheduled { delay }
    }

    /// Re-queue every entry due at `now`. Returns how many were dispatched.
    ///
    /// Entries for paths no longer in flight are stale and dropped.
    pub fn dispatch_due(&self, now: Instant) -> usize {
        let mut state = self.dispatcher.state.lock();
        let mut dispatched = 0;

        while state
            .delay
            .peek()
            .is_some_and(|Reverse(entry)| entry.due <= now)
        {
            let Some(Reverse(entry)) = state.delay.pop() else {
                break;
            };

            if !state.inflight.contains(&entry.path) {
                debug!(path = %entry.path.display(), "Dropping stale retry");
                continue;
            }

            let item = WorkItem {
                path: entry.path,
                attempt: entry.attempt,
            };
            if self.dispatcher.tx.send(item).is_err() {
                break;
            }
            dispatched += 1;
        }

        dispatched
    }

    /// Retries waiting in the delay queue
    pub fn pending(&self) -> usize {
        self.dispatcher.state.lock().delay.len()
    }

    /// Poll the delay queue until cancelled; pending retries are then discarded
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "Retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    let dispatched = self.dispatch_due(Instant::now());
                    if dispatched > 0 {
                        debug!(dispatched, "Re-queued due retries");
                    }
                }
            }
        }

        let discarded = {
            let mut state = self.dispatcher.state.lock();
            let pending: Vec<_> = state.delay.drain().collect();
            for Reverse(entry) in &pending {
                state.inflight.remove(&entry.path);
            }
            pending.len()
        };
        info!(discarded, "Retry scheduler stopped, pending retries discarded");
    }
}

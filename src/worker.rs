//! Sync worker: one per partition, pulls, maps, publishes, then persists.
//!
//! ```text
//! Loading ──get cursor──► Streaming ──shutdown──► Stopped
//!    │                       │
//!    └── store error ────────┴── fatal source error ──► Faulted
//!                                 or stalled cursor
//! ```
//!
//! A batch with events must move the cursor. One that doesn't would be
//! pulled and republished forever, so the worker faults with `Config`.
//!
//! # Delivery Guarantee
//!
//! The cursor is advanced only after the publisher acknowledged the whole
//! batch. A crash between publish and persist replays that batch on restart
//! (at-least-once); nothing is ever skipped.
//!
//! # Graceful Shutdown
//!
//! Shutdown is observed at the top of the loop and while waiting (pull, poll
//! sleep, retry backoff). A publish that has already been sent and the
//! persist that follows it always run to completion, so a stopped worker
//! never leaves an acknowledged batch without its cursor write attempt.

use crate::config::WorkerConfig;
use crate::cursor::CursorStore;
use crate::error::ReactivatorError;
use crate::mapper::ChangeMapper;
use crate::metrics;
use crate::model::{now_ms, ChangeNotification};
use crate::publisher::ChangePublisher;
use crate::resilience::{Backoff, RateLimiter, RetryConfig};
use crate::sequence::SequenceGenerator;
use crate::source::{ChangeSource, SourceBatch};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Lifecycle of a sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Loading,
    Streaming,
    Faulted,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Loading => "Loading",
            WorkerState::Streaming => "Streaming",
            WorkerState::Faulted => "Faulted",
            WorkerState::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Faulted | WorkerState::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker's `run` ended.
#[derive(Debug)]
pub enum WorkerExit {
    Stopped,
    Faulted(ReactivatorError),
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub cursors: Arc<dyn CursorStore>,
    pub sequence: Arc<SequenceGenerator>,
    pub publisher: Arc<dyn ChangePublisher>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

pub struct SyncWorker {
    source_id: String,
    partition: String,
    source: Arc<dyn ChangeSource>,
    deps: WorkerDeps,
    mapper: ChangeMapper,
    poll_interval: Duration,
    retry: RetryConfig,
    state_tx: Arc<watch::Sender<WorkerState>>,
}

impl SyncWorker {
    pub fn new(
        source_id: impl Into<String>,
        source: Arc<dyn ChangeSource>,
        deps: WorkerDeps,
        config: &WorkerConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Loading);
        Self {
            source_id: source_id.into(),
            partition: source.partition().to_string(),
            source,
            deps,
            mapper: ChangeMapper::new(),
            poll_interval: config.poll_interval_duration(),
            retry: config.retry_config(),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions. Remains readable after `run` returns.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Sender side of the state channel, for marking the worker faulted when
    /// `run` never returns normally.
    pub(crate) fn state_sender(&self) -> Arc<watch::Sender<WorkerState>> {
        Arc::clone(&self.state_tx)
    }

    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
        metrics::set_worker_state(&self.partition, state.as_str());
    }

    fn fault(&self, err: ReactivatorError) -> WorkerExit {
        error!(error = %err, fatal = err.is_fatal(), "Worker faulted");
        self.set_state(WorkerState::Faulted);
        WorkerExit::Faulted(err)
    }

    /// Run until shutdown or a fault.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> WorkerExit {
        let span = info_span!("worker", partition = %self.partition);

        async move {
            self.set_state(WorkerState::Loading);

            let mut cursor = match self.deps.cursors.get(&self.partition).await {
                Ok(Some(c)) => {
                    info!(cursor = %c, "Resuming from cursor");
                    Some(c)
                }
                Ok(None) => {
                    let initial = self.source.initial_cursor();
                    info!(cursor = ?initial, "No persisted cursor, starting from source default");
                    initial
                }
                Err(e) => return self.fault(e),
            };

            self.set_state(WorkerState::Streaming);

            let mut backoff = Backoff::new(self.retry.clone());
            // Set when the cursor moved in memory but the store write failed.
            let mut unpersisted = false;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if unpersisted {
                    if let Some(ref c) = cursor {
                        unpersisted = !self.persist(c).await;
                    }
                }

                if let Some(ref limiter) = self.deps.rate_limiter {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                        _ = limiter.acquire() => {}
                    }
                }

                let pulled = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    result = self.source.pull_since(cursor.as_deref()) => result,
                };

                let batch = match pulled {
                    Ok(batch) => {
                        backoff.reset();
                        batch
                    }
                    Err(e) if e.is_fatal() => return self.fault(e),
                    Err(e) => {
                        metrics::record_source_error(&self.partition);
                        let delay = backoff.next_delay();
                        warn!(
                            error = %e,
                            attempts = backoff.attempts(),
                            backoff_ms = delay.as_millis() as u64,
                            "Source pull failed, backing off"
                        );
                        if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                            break;
                        }
                        continue;
                    }
                };

                if batch.is_empty() {
                    // Sources may move the cursor without events (bookmarks).
                    if let Some(next) = batch.next_cursor {
                        if cursor.as_deref() != Some(next.as_str()) {
                            unpersisted = !self.persist(&next).await;
                            cursor = Some(next);
                        }
                    }
                    if !sleep_or_shutdown(self.poll_interval, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }

                let advances = matches!(
                    batch.next_cursor.as_deref(),
                    Some(next) if cursor.as_deref() != Some(next)
                );
                if !advances {
                    return self.fault(ReactivatorError::Config(format!(
                        "source returned {} events without advancing the cursor past {:?}",
                        batch.events.len(),
                        cursor
                    )));
                }

                metrics::record_events_pulled(&self.partition, batch.events.len());
                let notifications = self.stamp(&batch).await;

                if !self.publish_with_retry(&notifications, &mut shutdown_rx).await {
                    info!("Shutdown during publish retry, cursor not advanced");
                    break;
                }

                if let Some(next) = batch.next_cursor {
                    unpersisted = !self.persist(&next).await;
                    cursor = Some(next);
                }
            }

            self.set_state(WorkerState::Stopped);
            info!(cursor = ?cursor, "Worker stopped");
            WorkerExit::Stopped
        }
        .instrument(span)
        .await
    }

    /// Map every raw event in order and stamp the survivors with sequence
    /// numbers. Unmappable events are logged and dropped.
    async fn stamp(&self, batch: &SourceBatch) -> Vec<ChangeNotification> {
        let received_ms = now_ms();
        let mut notifications = Vec::with_capacity(batch.events.len());

        for event in &batch.events {
            let change = match self.mapper.map(event, received_ms) {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Skipping unmappable event");
                    metrics::record_mapping_skipped(&self.partition);
                    continue;
                }
            };
            let sequence = self.deps.sequence.next().await;
            notifications.push(change.into_notification(
                sequence,
                &self.source_id,
                &self.partition,
                batch.next_cursor.clone(),
            ));
        }
        notifications
    }

    /// Publish until acknowledged. Returns `false` if shutdown interrupted
    /// the retry loop before an acknowledgement.
    async fn publish_with_retry(
        &self,
        batch: &[ChangeNotification],
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        if batch.is_empty() {
            return true;
        }
        let mut backoff = Backoff::new(self.retry.clone());

        loop {
            let start = Instant::now();
            match self.deps.publisher.publish(&self.source_id, batch).await {
                Ok(()) => {
                    metrics::record_events_published(&self.partition, batch.len(), start.elapsed());
                    debug!(count = batch.len(), "Batch published");
                    return true;
                }
                Err(e) => {
                    metrics::record_publish_failure(&self.partition);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempts = backoff.attempts(),
                        backoff_ms = delay.as_millis() as u64,
                        "Publish failed, retrying same batch"
                    );
                    if !sleep_or_shutdown(delay, shutdown_rx).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn persist(&self, cursor: &str) -> bool {
        match self.deps.cursors.set(&self.partition, cursor).await {
            Ok(()) => {
                metrics::record_cursor_persist(&self.partition, true);
                true
            }
            Err(e) => {
                metrics::record_cursor_persist(&self.partition, false);
                warn!(error = %e, cursor, "Failed to persist cursor, will retry");
                false
            }
        }
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Sleep for `delay` unless shutdown comes first. Returns `true` if the
/// full delay elapsed.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown_rx) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

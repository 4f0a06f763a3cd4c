// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker supervisor.
//!
//! Owns the lifecycle of everything that streams:
//! - One [`SyncWorker`] per configured partition
//! - The sequence checkpoint task
//! - The shared shutdown signal
//!
//! # Fault Policy
//!
//! Workers are isolated from each other's transient trouble; each retries
//! on its own. A worker that faults on a **fatal** error (bad config,
//! rejected credentials) takes the process down: every sibling is signalled,
//! given `shutdown_timeout` to finish its in-flight publish and persist,
//! then abandoned. A panicking worker is treated the same way, as an
//! `Internal` fault. A worker-local fault (its cursor unreadable at startup)
//! is logged and the rest keep running.

mod types;

pub use types::{SupervisorHealth, SupervisorState, WorkerHealth};

use crate::config::ReactivatorConfig;
use crate::cursor::CursorStore;
use crate::error::{ReactivatorError, Result};
use crate::metrics;
use crate::publisher::ChangePublisher;
use crate::resilience::RateLimiter;
use crate::sequence::SequenceGenerator;
use crate::source::ChangeSource;
use crate::worker::{SyncWorker, WorkerDeps, WorkerExit, WorkerState};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Collaborators the supervisor composes workers from.
pub struct SupervisorDeps {
    /// One source per partition.
    pub sources: Vec<Arc<dyn ChangeSource>>,
    pub cursors: Arc<dyn CursorStore>,
    pub sequence: Arc<SequenceGenerator>,
    pub publisher: Arc<dyn ChangePublisher>,
}

/// Read-only view of supervisor and worker state.
///
/// Cheap to clone; handed to the HTTP server for `/health`.
#[derive(Clone)]
pub struct HealthMonitor {
    state_rx: watch::Receiver<SupervisorState>,
    workers: Arc<[(String, watch::Receiver<WorkerState>)]>,
    sequence: Arc<SequenceGenerator>,
}

impl HealthMonitor {
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Resolves once the supervisor has begun shutting down, for whatever
    /// reason. Used to close the HTTP surface alongside the drain.
    pub async fn stopping(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|s| *s == SupervisorState::ShuttingDown || s.is_final())
            .await;
    }

    pub fn health(&self) -> SupervisorHealth {
        let state = self.state();
        SupervisorHealth {
            state,
            ready: state == SupervisorState::Running,
            workers: self
                .workers
                .iter()
                .map(|(partition, rx)| WorkerHealth {
                    partition: partition.clone(),
                    state: *rx.borrow(),
                })
                .collect(),
            sequence: self.sequence.current(),
        }
    }
}

pub struct Supervisor {
    config: ReactivatorConfig,
    cursors: Arc<dyn CursorStore>,
    sequence: Arc<SequenceGenerator>,
    state_tx: watch::Sender<SupervisorState>,
    shutdown_tx: watch::Sender<bool>,
    monitor: HealthMonitor,
    /// Built in `new`, moved into tasks by `start`.
    pending: Vec<SyncWorker>,
    tasks: JoinSet<(String, WorkerExit)>,
    flush_handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Compose workers for every source. Fails on an invalid config or when
    /// the sources don't cover the configured partitions one-to-one.
    pub fn new(config: ReactivatorConfig, deps: SupervisorDeps) -> Result<Self> {
        config.validate()?;

        let mut configured: Vec<&str> = config.partitions.iter().map(String::as_str).collect();
        let mut provided: Vec<&str> = deps.sources.iter().map(|s| s.partition()).collect();
        configured.sort_unstable();
        provided.sort_unstable();
        if configured != provided {
            return Err(ReactivatorError::Config(format!(
                "sources {:?} do not match configured partitions {:?}",
                provided, configured
            )));
        }

        let rate_limiter = config.settings.worker.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for source pulls"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let worker_deps = WorkerDeps {
            cursors: Arc::clone(&deps.cursors),
            sequence: Arc::clone(&deps.sequence),
            publisher: deps.publisher,
            rate_limiter,
        };

        let pending: Vec<SyncWorker> = deps
            .sources
            .into_iter()
            .map(|source| {
                SyncWorker::new(
                    config.source_id.clone(),
                    source,
                    worker_deps.clone(),
                    &config.settings.worker,
                )
            })
            .collect();

        let (state_tx, state_rx) = watch::channel(SupervisorState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        let monitor = HealthMonitor {
            state_rx,
            workers: pending
                .iter()
                .map(|w| (w.partition().to_string(), w.subscribe()))
                .collect(),
            sequence: Arc::clone(&deps.sequence),
        };

        Ok(Self {
            config,
            cursors: deps.cursors,
            sequence: deps.sequence,
            state_tx,
            shutdown_tx,
            monitor,
            pending,
            tasks: JoinSet::new(),
            flush_handle: None,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> HealthMonitor {
        self.monitor.clone()
    }

    pub fn health(&self) -> SupervisorHealth {
        self.monitor.health()
    }

    fn set_state(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
        metrics::set_supervisor_state(state.as_str());
    }

    /// Load the sequence checkpoint, then spawn the flush task and every
    /// worker.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != SupervisorState::Created {
            return Err(ReactivatorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            source_id = %self.config.source_id,
            partitions = self.pending.len(),
            "Starting reactivator"
        );
        self.set_state(SupervisorState::Starting);

        if let Err(e) = self.sequence.load().await {
            error!(error = %e, "Cannot load sequence checkpoint");
            self.set_state(SupervisorState::Failed);
            return Err(e);
        }

        self.flush_handle = Some(self.sequence.spawn_flush_task(
            self.config.settings.sequence.flush_interval_duration(),
            self.shutdown_tx.subscribe(),
        ));

        for worker in std::mem::take(&mut self.pending) {
            let partition = worker.partition().to_string();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let state_tx = worker.state_sender();
            self.tasks.spawn(async move {
                let exit = match AssertUnwindSafe(worker.run(shutdown_rx)).catch_unwind().await {
                    Ok(exit) => exit,
                    Err(payload) => {
                        state_tx.send_replace(WorkerState::Faulted);
                        metrics::set_worker_state(&partition, WorkerState::Faulted.as_str());
                        WorkerExit::Faulted(ReactivatorError::Internal(format!(
                            "worker panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    }
                };
                (partition, exit)
            });
        }

        self.set_state(SupervisorState::Running);
        info!(workers = self.tasks.len(), "Reactivator running");
        Ok(())
    }

    /// Supervise until `shutdown` resolves, a worker faults fatally, or
    /// every worker has exited. Always ends with the shutdown sequence.
    ///
    /// Returns the fatal fault, if that is what ended the run.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut fault: Option<ReactivatorError> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    None => {
                        info!("All workers exited");
                        break;
                    }
                    Some(Ok((partition, WorkerExit::Stopped))) => {
                        debug!(partition = %partition, "Worker stopped");
                    }
                    Some(Ok((partition, WorkerExit::Faulted(e)))) if e.is_fatal() => {
                        error!(partition = %partition, error = %e, "Fatal worker fault, stopping all workers");
                        fault = Some(e);
                        break;
                    }
                    Some(Ok((partition, WorkerExit::Faulted(e)))) => {
                        warn!(partition = %partition, error = %e, "Worker faulted, siblings continue");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Worker task lost, stopping all workers");
                        fault = Some(ReactivatorError::Internal(format!("worker task lost: {}", e)));
                        break;
                    }
                },
            }
        }

        self.drain().await;

        match fault {
            Some(e) => {
                self.set_state(SupervisorState::Failed);
                Err(e)
            }
            None => {
                self.set_state(SupervisorState::Stopped);
                info!("Reactivator stopped");
                Ok(())
            }
        }
    }

    /// Graceful shutdown without waiting for an external signal.
    pub async fn shutdown(&mut self) {
        if self.state().is_final() {
            return;
        }
        self.drain().await;
        self.set_state(SupervisorState::Stopped);
        info!("Reactivator stopped");
    }

    /// Signal, wait up to the timeout, abandon stragglers, checkpoint, close.
    async fn drain(&mut self) {
        self.set_state(SupervisorState::ShuttingDown);
        self.shutdown_tx.send_replace(true);

        let timeout = self.config.settings.supervisor.shutdown_timeout_duration();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        if !self.tasks.is_empty() {
            info!(workers = self.tasks.len(), timeout_ms = timeout.as_millis() as u64, "Waiting for workers to stop");
        }

        while !self.tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                joined = self.tasks.join_next() => match joined {
                    Some(Ok((partition, WorkerExit::Faulted(e)))) => {
                        warn!(partition = %partition, error = %e, "Worker faulted during shutdown");
                    }
                    Some(Ok((partition, WorkerExit::Stopped))) => {
                        debug!(partition = %partition, "Worker stopped");
                    }
                    Some(Err(e)) => warn!(error = %e, "Worker task panicked during shutdown"),
                    None => break,
                },
            }
        }

        if !self.tasks.is_empty() {
            for (partition, state_rx) in self.monitor.workers.iter() {
                if !state_rx.borrow().is_terminal() {
                    warn!(partition = %partition, "Worker did not stop in time, abandoning");
                    metrics::record_worker_abandoned(partition);
                }
            }
            self.tasks.abort_all();
            self.tasks.detach_all();
        }

        if let Some(handle) = self.flush_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sequence flush task panicked");
            }
        }
        // Workers may have stamped after the flush task's final checkpoint.
        if let Err(e) = self.sequence.flush().await {
            warn!(error = %e, "Final sequence checkpoint failed");
        }

        self.cursors.close().await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

//! Process-wide sequence generator.
//!
//! Every outgoing [`ChangeNotification`](crate::model::ChangeNotification)
//! is stamped with a value from one shared counter, giving a total order per
//! reactivator instance.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► load() ──► next() … next() ──► flush() (periodic + on shutdown)
//!   │          │
//!   │          └─ opens the gate: callers blocked in next() proceed
//!   └─ next() callers wait here
//! ```
//!
//! # Durability
//!
//! The counter is checkpointed under [`SEQUENCE_KEY`] on a fixed interval,
//! only when it moved. After a crash the next incarnation resumes from the
//! last flushed value, so values handed out between that flush and the
//! crash may be issued again. Within one process lifetime values are
//! strictly increasing; across restarts they are an ordering hint only.

use crate::cursor::CursorStore;
use crate::error::{ReactivatorError, Result};
use crate::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cursor-store key holding the checkpointed counter.
pub const SEQUENCE_KEY: &str = "sequence";

/// Monotonic counter shared by all workers in a process.
pub struct SequenceGenerator {
    store: Arc<dyn CursorStore>,
    value: AtomicU64,
    last_flushed: AtomicU64,
    loaded_tx: watch::Sender<bool>,
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn CursorStore>) -> Self {
        let (loaded_tx, _) = watch::channel(false);
        Self {
            store,
            value: AtomicU64::new(0),
            last_flushed: AtomicU64::new(0),
            loaded_tx,
        }
    }

    /// Read the last checkpoint and release any `next()` callers.
    ///
    /// A store failure here is returned to the caller and the gate stays
    /// closed; a process can't safely hand out sequence numbers without
    /// knowing where the previous incarnation stopped.
    pub async fn load(&self) -> Result<u64> {
        let persisted = match self.store.get(SEQUENCE_KEY).await? {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                ReactivatorError::Config(format!("Stored sequence '{}' is not a u64: {}", raw, e))
            })?,
            None => 0,
        };
        if persisted == u64::MAX {
            return Err(ReactivatorError::Config(format!(
                "Stored sequence {} leaves no room for another value",
                persisted
            )));
        }

        self.value.fetch_max(persisted, Ordering::SeqCst);
        self.last_flushed.store(persisted, Ordering::SeqCst);
        self.loaded_tx.send_replace(true);

        info!(sequence = persisted, "Sequence generator loaded");
        Ok(persisted)
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded_tx.borrow()
    }

    /// Next sequence value. Waits until [`load`](Self::load) has completed.
    pub async fn next(&self) -> u64 {
        if !self.is_loaded() {
            let mut rx = self.loaded_tx.subscribe();
            // The sender lives in self, so this only ends once loaded.
            let _ = rx.wait_for(|loaded| *loaded).await;
        }
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current value without incrementing.
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Persist the counter if it moved since the last flush.
    ///
    /// Returns `true` if a write happened.
    pub async fn flush(&self) -> Result<bool> {
        if !self.is_loaded() {
            // Never overwrite a checkpoint we haven't read.
            return Ok(false);
        }
        let value = self.current();
        if value == self.last_flushed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        self.store.set(SEQUENCE_KEY, &value.to_string()).await?;
        self.last_flushed.fetch_max(value, Ordering::SeqCst);
        metrics::record_sequence_flush(value);
        debug!(sequence = value, "Sequence checkpointed");
        Ok(true)
    }

    /// Spawn the periodic checkpoint loop.
    ///
    /// Flushes every `interval` and once more when `shutdown_rx` flips to
    /// `true`, then exits.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let generator = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = generator.flush().await {
                            warn!(error = %e, "Failed to checkpoint sequence");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            match generator.flush().await {
                Ok(true) => info!(sequence = generator.current(), "Final sequence checkpoint written"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed final sequence checkpoint"),
            }
            debug!("Sequence flush task stopped");
        })
    }
}

//! Recording publisher.
//!
//! Keeps every acknowledged batch for assertions. Failures can be injected
//! for the next N calls or switched on until further notice.

use async_trait::async_trait;
use cdc_reactivator::error::{ReactivatorError, Result};
use cdc_reactivator::model::ChangeNotification;
use cdc_reactivator::publisher::{topic_for, ChangePublisher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct RecordingPublisher {
    /// Acknowledged batches as (topic, batch)
    published: Mutex<Vec<(String, Vec<ChangeNotification>)>>,
    /// Fail this many upcoming calls
    fail_next: AtomicUsize,
    /// Fail every call while set
    fail_all: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every acknowledged notification, flattened in publish order.
    pub fn notifications(&self) -> Vec<ChangeNotification> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect()
    }

    pub fn batches(&self) -> Vec<(String, Vec<ChangeNotification>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangePublisher for RecordingPublisher {
    async fn publish(&self, source_id: &str, batch: &[ChangeNotification]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let topic = topic_for(source_id);

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.fail_all.load(Ordering::SeqCst) {
            return Err(ReactivatorError::publish_msg(topic, "503: sidecar unavailable"));
        }

        self.published.lock().unwrap().push((topic, batch.to_vec()));
        Ok(())
    }
}

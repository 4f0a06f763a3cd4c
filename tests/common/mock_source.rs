//! Scripted sources for driving workers and bootstrap without a live feed.

use async_trait::async_trait;
use cdc_reactivator::error::{ReactivatorError, Result};
use cdc_reactivator::model::EntityState;
use cdc_reactivator::source::{ChangeSource, SnapshotPage, SnapshotSource, SourceBatch};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Change source that replays a fixed script of pull results, then returns
/// empty batches forever.
///
/// Every cursor it was asked to pull from is recorded so tests can check
/// where a worker resumed.
pub struct ScriptedSource {
    partition: String,
    script: Mutex<VecDeque<Result<SourceBatch>>>,
    seen: Mutex<Vec<Option<String>>>,
    panic_on: Option<usize>,
}

impl ScriptedSource {
    pub fn new(partition: &str, script: Vec<Result<SourceBatch>>) -> Self {
        Self {
            partition: partition.to_string(),
            script: Mutex::new(script.into()),
            seen: Mutex::default(),
            panic_on: None,
        }
    }

    /// Panic inside pull number `index` (zero-based), like a buggy client.
    pub fn panicking_on(mut self, index: usize) -> Self {
        self.panic_on = Some(index);
        self
    }

    /// Source that never has anything to say.
    pub fn idle(partition: &str) -> Self {
        Self::new(partition, Vec::new())
    }

    /// Cursors passed to `pull_since`, in call order.
    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn pull_since(&self, cursor: Option<&str>) -> Result<SourceBatch> {
        let pull = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(cursor.map(String::from));
            seen.len() - 1
        };
        if self.panic_on == Some(pull) {
            panic!("scripted source {} panicked on pull {}", self.partition, pull);
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SourceBatch::empty()))
    }
}

/// Snapshot source serving pages keyed "0", "1", ...
pub struct PagedSnapshotSource {
    pages: Vec<Vec<EntityState>>,
    fail_on: Option<usize>,
    calls: AtomicUsize,
}

impl PagedSnapshotSource {
    pub fn new(pages: Vec<Vec<EntityState>>) -> Self {
        Self {
            pages,
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail when page `index` is requested.
    pub fn failing_on(mut self, index: usize) -> Self {
        self.fail_on = Some(index);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for PagedSnapshotSource {
    async fn list_page(&self, page: Option<&str>) -> Result<SnapshotPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = match page {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ReactivatorError::source("snapshot", format!("bad page token {}", token)))?,
            None => 0,
        };
        if self.fail_on == Some(index) {
            return Err(ReactivatorError::source("snapshot", "503 Service Unavailable"));
        }
        Ok(SnapshotPage {
            entities: self.pages.get(index).cloned().unwrap_or_default(),
            next_page: (index + 1 < self.pages.len()).then(|| (index + 1).to_string()),
        })
    }
}

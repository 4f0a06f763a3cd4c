#![allow(dead_code)]

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Scripted change sources and a paged snapshot source
//! - A recording publisher with injectable failures
//! - Raw event and polling helpers

pub mod mock_publisher;
pub mod mock_source;

pub use mock_publisher::*;
pub use mock_source::*;

use cdc_reactivator::cursor::MemoryCursorStore;
use cdc_reactivator::mapper::{RawEvent, RelationalOp};
use serde_json::json;
use std::time::Duration;

/// Debezium-style insert of one `orders` row.
pub fn order_created(id: &str) -> RawEvent {
    RawEvent::Relational {
        op: RelationalOp::Create,
        table: "orders".into(),
        before: None,
        after: Some(json!({ "id": id, "status": "new" })),
        ts_ms: 1_700_000_000_000,
    }
}

/// Poll the store until `key` holds `expected`.
pub async fn wait_for_cursor(store: &MemoryCursorStore, key: &str, expected: &str) {
    for _ in 0..400 {
        if store.snapshot().await.get(key).map(String::as_str) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "cursor {} never reached {} (have {:?})",
        key,
        expected,
        store.snapshot().await.get(key)
    );
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time: {}", what);
}

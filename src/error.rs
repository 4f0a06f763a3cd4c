// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the reactivator.
//!
//! Errors are categorized by how a sync worker must react to them: retry in
//! place, skip the offending record, or fault and take the process down.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Source` | Yes | No | Network blip, throttling, source temporarily down |
//! | `Publish` | Yes | No | Event bus unavailable or circuit open |
//! | `CursorUnavailable` | Yes | No | Cursor backend unreachable |
//! | `CursorStore` | No | No | Local SQLite errors (busy is retried internally) |
//! | `Mapping` | No | No | One malformed raw event, skipped |
//! | `Config` | No | Yes | Configuration invalid |
//! | `Auth` | No | Yes | Credentials rejected by the source |
//! | `Bootstrap` | No | No | Snapshot paging failed mid-request |
//! | `InvalidRequest` | No | No | Malformed inbound HTTP request |
//! | `InvalidState` | No | No | Lifecycle state machine violation |
//! | `Shutdown` | No | No | Aborted because shutdown was signalled |
//! | `Internal` | No | Yes | Unexpected internal error (e.g. a worker panic) |
//!
//! # Retry Behavior
//!
//! Use [`ReactivatorError::is_retryable()`] to decide whether a worker should
//! back off and try the same operation again without advancing its cursor.
//! Use [`ReactivatorError::is_fatal()`] to decide whether a worker fault must
//! terminate the whole process.

use thiserror::Error;

/// Result type alias for reactivator operations.
pub type Result<T> = std::result::Result<T, ReactivatorError>;

/// Errors that can occur while reactivating a source.
#[derive(Error, Debug)]
pub enum ReactivatorError {
    /// Transient failure pulling from a source partition.
    #[error("Source error ({partition}): {message}")]
    Source { partition: String, message: String },

    /// Publishing a batch to the event bus failed.
    ///
    /// The worker must not advance its cursor until a retry succeeds.
    #[error("Publish error ({topic}): {message}")]
    Publish {
        topic: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// SQLite error during cursor persistence.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Cursor backend could not be reached (non-SQLite stores).
    #[error("Cursor store unavailable ({key}): {message}")]
    CursorUnavailable { key: String, message: String },

    /// A raw event could not be normalized into a change notification.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source rejected our credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Snapshot listing failed part way through.
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    /// Inbound request failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReactivatorError {
    /// Create a source error for a partition.
    pub fn source(partition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Create a publish error from a reqwest failure.
    pub fn publish(topic: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a publish error without an underlying transport error.
    pub fn publish_msg(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { .. } => true,
            Self::Publish { .. } => true,
            Self::CursorUnavailable { .. } => true,
            Self::CursorStore(_) => false, // busy/locked already retried in the store
            Self::Mapping(_) => false,
            Self::Config(_) => false,
            Self::Auth(_) => false,
            Self::Bootstrap(_) => false,
            Self::InvalidRequest(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if a worker fault with this error must terminate the process.
    ///
    /// Configuration and credential problems qualify, since restarting with
    /// the same inputs cannot fix them. So does an internal fault such as a
    /// panicked worker: running with a silently stalled partition is worse
    /// than a visible crash.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Auth(_) | Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_source() {
        let err = ReactivatorError::source("partition-0", "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("partition-0"));
    }

    #[test]
    fn test_is_retryable_publish() {
        let err = ReactivatorError::publish_msg("orders-change", "503 Service Unavailable");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("orders-change"));
    }

    #[test]
    fn test_is_retryable_cursor_unavailable() {
        let err = ReactivatorError::CursorUnavailable {
            key: "partition-1".to_string(),
            message: "timeout".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_not_retryable_mapping() {
        let err = ReactivatorError::Mapping("body is not JSON".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_config() {
        let err = ReactivatorError::Config("no partitions configured".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_auth() {
        let err = ReactivatorError::Auth("401 Unauthorized".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReactivatorError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_fatal_internal() {
        let err = ReactivatorError::Internal("worker p0 panicked".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_retryable_shutdown() {
        let err = ReactivatorError::Shutdown;
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bootstrap_error_formatting() {
        let err = ReactivatorError::Bootstrap("page 3 failed".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Bootstrap error"));
        assert!(msg.contains("page 3"));
    }
}

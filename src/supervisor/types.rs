//! Supervisor state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (sequence loaded, workers spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!                    │
//!                    │ (fatal worker fault or panic, or sequence load failed)
//!                    ↓
//!                  Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `Supervisor::new()`. Nothing spawned.
//! - **Starting**: Loading the sequence checkpoint.
//! - **Running**: Workers streaming. Health endpoint reports ready.
//! - **ShuttingDown**: Workers signalled, waiting up to the shutdown timeout.
//! - **Stopped**: Graceful shutdown complete.
//! - **Failed**: A fatal fault ended the process.

use crate::worker::WorkerState;
use serde::Serialize;

/// State of the worker supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Created => "Created",
            SupervisorState::Starting => "Starting",
            SupervisorState::Running => "Running",
            SupervisorState::ShuttingDown => "ShuttingDown",
            SupervisorState::Stopped => "Stopped",
            SupervisorState::Failed => "Failed",
        }
    }

    /// No further transitions happen from here.
    pub fn is_final(&self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed)
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot served by the health endpoint.
///
/// Built from watch channels and atomics only; taking one does no I/O.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorHealth {
    pub state: SupervisorState,
    /// `true` only while `Running`.
    pub ready: bool,
    pub workers: Vec<WorkerHealth>,
    /// Last sequence number issued.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub partition: String,
    pub state: WorkerState,
}

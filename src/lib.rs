//! # CDC Reactivator
//!
//! Tails a change feed partition by partition, maps raw events into graph
//! node and relation changes, and publishes them in order to a Dapr pub/sub
//! topic. A small HTTP surface serves bootstrap snapshots and announces
//! query subscriptions on the same topic.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             cdc-reactivator                              │
//! │                                                                          │
//! │  ┌────────────┐    ┌────────────┐    ┌──────────┐    ┌────────────────┐  │
//! │  │ Supervisor │───►│ SyncWorker │───►│  Mapper  │───►│ DaprPublisher  │  │
//! │  │            │    │ (per part.)│    │ + seq no │    │ {id}-change    │  │
//! │  └────────────┘    └────────────┘    └──────────┘    └────────────────┘  │
//! │         │                 │                                  ▲           │
//! │         ▼                 ▼                                  │           │
//! │  ┌────────────┐    ┌─────────────┐    ┌───────────────────────────────┐  │
//! │  │  /health   │    │ CursorStore │    │ HTTP: /acquire, /subscription │  │
//! │  │            │    │  (SQLite)   │    │ (BootstrapService)            │  │
//! │  └────────────┘    └─────────────┘    └───────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! A worker persists its cursor only after the batch that produced it has
//! been published, so a crash replays at most the last batch. Consumers
//! deduplicate by sequence number.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cdc_reactivator::{ReactivatorConfig, Supervisor, SupervisorDeps};
//! # async fn run(deps: SupervisorDeps) -> cdc_reactivator::Result<()> {
//! let config = ReactivatorConfig::from_yaml_file("config.yaml")?;
//! let mut supervisor = Supervisor::new(config, deps)?;
//! supervisor.start().await?;
//! supervisor.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod bootstrap;
pub mod circuit_breaker;
pub mod config;
pub mod cursor;
pub mod error;
pub mod mapper;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod resilience;
pub mod sequence;
pub mod server;
pub mod source;
pub mod supervisor;
pub mod worker;

// Re-exports for convenience
pub use bootstrap::BootstrapService;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{FeedConfig, PublisherConfig, ReactivatorConfig, ReactivatorSettings, WorkerConfig};
pub use cursor::{CursorStore, MemoryCursorStore, SqliteCursorStore};
pub use error::{ReactivatorError, Result};
pub use mapper::{ChangeMapper, RawEvent};
pub use model::{ChangeNotification, EntityState, MappedChange, SubscriptionRequest};
pub use publisher::{ChangePublisher, DaprPublisher};
pub use sequence::SequenceGenerator;
pub use source::{ChangeSource, HttpFeed, SnapshotSource, SourceBatch};
pub use supervisor::{HealthMonitor, Supervisor, SupervisorDeps, SupervisorState};
pub use worker::{SyncWorker, WorkerState};

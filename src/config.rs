//! Configuration for the reactivator.
//!
//! Configuration is passed to [`Supervisor::new()`](crate::Supervisor::new)
//! and the HTTP server, and can be constructed programmatically or loaded
//! from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use cdc_reactivator::config::ReactivatorConfig;
//!
//! let config = ReactivatorConfig {
//!     source_id: "orders".into(),
//!     partitions: vec!["partition-0".into(), "partition-1".into()],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReactivatorConfig
//! ├── source_id: String               # Identity of the observed source
//! ├── settings: ReactivatorSettings
//! │   ├── worker: WorkerConfig        # Poll cadence, backoff, rate limit
//! │   ├── sequence: SequenceConfig    # Counter checkpoint interval
//! │   ├── supervisor: SupervisorConfig # Shutdown timeout
//! │   ├── publisher: PublisherConfig  # Dapr pub/sub endpoint
//! │   └── server: ServerConfig        # HTTP bind address
//! ├── partitions: Vec<String>         # One sync worker per entry
//! ├── cursor: CursorConfig            # SQLite cursor persistence
//! └── feed: FeedConfig                # Upstream HTTP feed
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source_id: "orders"
//!
//! settings:
//!   worker:
//!     poll_interval: "500ms"
//!   sequence:
//!     flush_interval: "2s"
//!   publisher:
//!     pubsub: "drasi-pubsub"
//!
//! partitions:
//!   - "partition-0"
//!   - "partition-1"
//!
//! cursor:
//!   sqlite_path: "/var/lib/reactivator/cursors.db"
//!
//! feed:
//!   base_url: "http://orders-feed:8080"
//! ```

use crate::error::{ReactivatorError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Parse a humantime duration, falling back to `default` with a warning.
fn parse_duration_or(field: &str, value: &str, default: Duration) -> Duration {
    match humantime::parse_duration(value) {
        Ok(d) => d,
        Err(e) => {
            warn!(field, value, error = %e, "Invalid duration, using default");
            default
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level reactivator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactivatorConfig {
    /// Identity of the source this process reactivates.
    /// Determines the bus topic (`{source_id}-change`).
    pub source_id: String,

    #[serde(default)]
    pub settings: ReactivatorSettings,

    /// Monitored entities/partitions. Each gets its own sync worker and
    /// its own cursor key.
    #[serde(default)]
    pub partitions: Vec<String>,

    #[serde(default)]
    pub cursor: CursorConfig,

    #[serde(default)]
    pub feed: FeedConfig,
}

impl Default for ReactivatorConfig {
    fn default() -> Self {
        Self {
            source_id: "local-source".to_string(),
            settings: ReactivatorSettings::default(),
            partitions: Vec::new(),
            cursor: CursorConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl ReactivatorConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(source_id: &str, partitions: &[&str]) -> Self {
        Self {
            source_id: source_id.to_string(),
            settings: ReactivatorSettings::for_testing(),
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            cursor: CursorConfig::in_memory(),
            feed: FeedConfig::default(),
        }
    }

    /// Load from a YAML (or JSON, which is valid YAML) file, then apply
    /// environment overrides and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReactivatorError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML string without validating.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| ReactivatorError::Config(format!("Invalid config: {}", e)))
    }

    /// Apply `SOURCE_ID`, `PUBSUB`, `DAPR_HOST` and `DAPR_PORT` overrides.
    ///
    /// The lookup is injected so tests don't have to mutate process env.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(source_id) = lookup("SOURCE_ID") {
            self.source_id = source_id;
        }
        if let Some(pubsub) = lookup("PUBSUB") {
            self.settings.publisher.pubsub = pubsub;
        }
        if let Some(host) = lookup("DAPR_HOST") {
            self.settings.publisher.dapr_host = host;
        }
        if let Some(port) = lookup("DAPR_PORT") {
            match port.parse() {
                Ok(p) => self.settings.publisher.dapr_port = p,
                Err(_) => warn!(value = %port, "Ignoring non-numeric DAPR_PORT"),
            }
        }
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(ReactivatorError::Config("source_id must not be empty".into()));
        }
        if self.partitions.is_empty() {
            return Err(ReactivatorError::Config("at least one partition is required".into()));
        }
        let mut seen = HashSet::new();
        for p in &self.partitions {
            if p.trim().is_empty() {
                return Err(ReactivatorError::Config("partition ids must not be empty".into()));
            }
            // The sequence counter shares the cursor keyspace.
            if p == crate::sequence::SEQUENCE_KEY {
                return Err(ReactivatorError::Config(format!(
                    "partition id '{}' is reserved",
                    p
                )));
            }
            if !seen.insert(p.as_str()) {
                return Err(ReactivatorError::Config(format!("duplicate partition '{}'", p)));
            }
        }

        // Zero would panic tokio's interval or spin the retry and poll loops.
        let worker = &self.settings.worker;
        let retry = worker.retry_config();
        let durations = [
            ("worker.poll_interval", worker.poll_interval_duration()),
            ("worker.backoff_initial", retry.initial_delay),
            ("worker.backoff_max", retry.max_delay),
            ("sequence.flush_interval", self.settings.sequence.flush_interval_duration()),
            ("supervisor.shutdown_timeout", self.settings.supervisor.shutdown_timeout_duration()),
            ("publisher.timeout", self.settings.publisher.timeout_duration()),
            ("publisher.circuit_reset_timeout", self.settings.publisher.circuit_reset_timeout_duration()),
            ("feed.timeout", self.feed.timeout_duration()),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ReactivatorError::Config(format!("{} must be greater than zero", field)));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(ReactivatorError::Config(
                "worker.backoff_initial must not exceed worker.backoff_max".into(),
            ));
        }
        Ok(())
    }
}

/// Tunable settings grouped by component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactivatorSettings {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub sequence: SequenceConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl ReactivatorSettings {
    /// Short timings suitable for tests.
    pub fn for_testing() -> Self {
        Self {
            worker: WorkerConfig {
                poll_interval: "10ms".to_string(),
                backoff_initial: "5ms".to_string(),
                backoff_max: "50ms".to_string(),
                ..Default::default()
            },
            sequence: SequenceConfig {
                flush_interval: "20ms".to_string(),
            },
            supervisor: SupervisorConfig {
                shutdown_timeout: "1s".to_string(),
            },
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WorkerConfig: per-partition sync loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How long to wait after an empty pull before pulling again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// First backoff after a retryable source/publish error.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: String,

    /// Backoff ceiling. Retries continue forever at this cadence.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    /// Throttle pulls across all workers.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_backoff_initial() -> String {
    "1s".to_string()
}

fn default_backoff_max() -> String {
    "5m".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or("worker.poll_interval", &self.poll_interval, Duration::from_secs(1))
    }

    /// Infinite retry schedule built from the configured backoff bounds.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: parse_duration_or(
                "worker.backoff_initial",
                &self.backoff_initial,
                Duration::from_secs(1),
            ),
            max_delay: parse_duration_or(
                "worker.backoff_max",
                &self.backoff_max,
                Duration::from_secs(300),
            ),
            ..RetryConfig::default()
        }
    }

    /// Get rate limit config if enabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SequenceConfig / SupervisorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Sequence counter checkpointing.
///
/// Values issued after the last flush are lost on crash and the next run
/// resumes from the flushed value, so a shorter interval narrows the range
/// of sequence numbers that can be reissued after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "1s".to_string()
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
        }
    }
}

impl SequenceConfig {
    pub fn flush_interval_duration(&self) -> Duration {
        parse_duration_or("sequence.flush_interval", &self.flush_interval, Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long to wait for workers to stop before abandoning them.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_timeout_duration(&self) -> Duration {
        parse_duration_or(
            "supervisor.shutdown_timeout",
            &self.shutdown_timeout,
            Duration::from_secs(10),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PublisherConfig: Dapr pub/sub sidecar
// ═══════════════════════════════════════════════════════════════════════════════

/// Event bus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_dapr_host")]
    pub dapr_host: String,

    #[serde(default = "default_dapr_port")]
    pub dapr_port: u16,

    /// Dapr pub/sub component name.
    #[serde(default = "default_pubsub")]
    pub pubsub: String,

    /// Per-request timeout.
    #[serde(default = "default_publish_timeout")]
    pub timeout: String,

    /// Consecutive failures before the publish circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the publish circuit stays open before probing.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,
}

fn default_dapr_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dapr_port() -> u16 {
    3500
}

fn default_pubsub() -> String {
    "drasi-pubsub".to_string()
}

fn default_publish_timeout() -> String {
    "10s".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            dapr_host: default_dapr_host(),
            dapr_port: default_dapr_port(),
            pubsub: default_pubsub(),
            timeout: default_publish_timeout(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
        }
    }
}

impl PublisherConfig {
    /// Base URL of the Dapr sidecar's publish API for this component.
    pub fn publish_base_url(&self) -> String {
        format!(
            "http://{}:{}/v1.0/publish/{}",
            self.dapr_host, self.dapr_port, self.pubsub
        )
    }

    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or("publisher.timeout", &self.timeout, Duration::from_secs(10))
    }

    pub fn circuit_reset_timeout_duration(&self) -> Duration {
        parse_duration_or(
            "publisher.circuit_reset_timeout",
            &self.circuit_reset_timeout,
            Duration::from_secs(30),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig / FeedConfig / CursorConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:80".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Upstream HTTP feed that exposes a source's changes and snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub base_url: String,

    /// Bearer token sent with every feed request, if set.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Where a partition starts when it has no persisted cursor.
    #[serde(default)]
    pub start_from: StartFrom,

    #[serde(default = "default_feed_timeout")]
    pub timeout: String,
}

/// Default resume position for a partition with no cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Only changes after startup.
    #[default]
    Now,
    /// Replay the source's retained history.
    Beginning,
}

fn default_feed_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_feed_timeout() -> String {
    "30s".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_url(),
            bearer_token: None,
            start_from: StartFrom::Now,
            timeout: default_feed_timeout(),
        }
    }
}

impl FeedConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or("feed.timeout", &self.timeout, Duration::from_secs(30))
    }
}

/// Cursor persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for cursor storage.
    pub sqlite_path: String,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "reactivator_cursors.db".to_string(),
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_fails_validation_without_partitions() {
        let config = ReactivatorConfig::default();
        assert!(matches!(config.validate(), Err(ReactivatorError::Config(_))));
    }

    #[test]
    fn test_for_testing_config_is_valid() {
        let config = ReactivatorConfig::for_testing("orders", &["partition-0", "partition-1"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.cursor.sqlite_path, ":memory:");
        assert_eq!(
            config.settings.sequence.flush_interval_duration(),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_validate_rejects_duplicates_and_reserved() {
        let dup = ReactivatorConfig::for_testing("orders", &["p0", "p0"]);
        assert!(dup.validate().unwrap_err().to_string().contains("duplicate"));

        let reserved = ReactivatorConfig::for_testing("orders", &["sequence"]);
        assert!(reserved.validate().unwrap_err().to_string().contains("reserved"));

        let empty_source = ReactivatorConfig::for_testing("  ", &["p0"]);
        assert!(empty_source.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let cases: [(&str, fn(&mut ReactivatorConfig)); 5] = [
            ("sequence.flush_interval", |c| c.settings.sequence.flush_interval = "0s".into()),
            ("worker.poll_interval", |c| c.settings.worker.poll_interval = "0ms".into()),
            ("worker.backoff_initial", |c| c.settings.worker.backoff_initial = "0s".into()),
            ("supervisor.shutdown_timeout", |c| c.settings.supervisor.shutdown_timeout = "0s".into()),
            ("publisher.timeout", |c| c.settings.publisher.timeout = "0s".into()),
        ];

        for (field, apply) in cases {
            let mut config = ReactivatorConfig::for_testing("orders", &["p0"]);
            apply(&mut config);
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ReactivatorError::Config(_)));
            assert!(err.to_string().contains(field), "{} not named in: {}", field, err);
        }
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = ReactivatorConfig::for_testing("orders", &["p0"]);
        config.settings.worker.backoff_initial = "10s".into();
        config.settings.worker.backoff_max = "1s".into();
        assert!(config.validate().unwrap_err().to_string().contains("backoff_initial"));
    }

    #[test]
    fn test_zero_flush_interval_in_yaml_is_rejected() {
        let yaml = r#"
source_id: "orders"
settings:
  sequence:
    flush_interval: "0s"
partitions: ["p0"]
"#;
        let config = ReactivatorConfig::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_parsing_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = SequenceConfig {
                flush_interval: input.to_string(),
            };
            assert_eq!(config.flush_interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = WorkerConfig {
            poll_interval: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_worker_retry_config_uses_bounds() {
        let config = WorkerConfig {
            backoff_initial: "200ms".to_string(),
            backoff_max: "2s".to_string(),
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(2));
    }

    #[test]
    fn test_rate_limit_config() {
        let mut config = WorkerConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 50;
        config.rate_limit_burst = 5;
        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 50);
        assert_eq!(rate.burst_size, 5);
    }

    #[test]
    fn test_publish_base_url() {
        let config = PublisherConfig::default();
        assert_eq!(
            config.publish_base_url(),
            "http://127.0.0.1:3500/v1.0/publish/drasi-pubsub"
        );
    }

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let yaml = r#"
source_id: "orders"
settings:
  sequence:
    flush_interval: "2s"
partitions:
  - "partition-0"
feed:
  base_url: "http://feed:9000"
  start_from: beginning
"#;
        let config = ReactivatorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.source_id, "orders");
        assert_eq!(config.partitions, vec!["partition-0".to_string()]);
        assert_eq!(config.settings.sequence.flush_interval_duration(), Duration::from_secs(2));
        assert_eq!(config.settings.worker.poll_interval, "1s");
        assert_eq!(config.feed.start_from, StartFrom::Beginning);
        assert_eq!(config.cursor.sqlite_path, "reactivator_cursors.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parse_error_is_config_error() {
        let err = ReactivatorConfig::from_yaml_str("partitions: {").unwrap_err();
        assert!(matches!(err, ReactivatorError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SOURCE_ID", "inventory"),
            ("PUBSUB", "bus"),
            ("DAPR_PORT", "3600"),
        ]
        .into_iter()
        .collect();

        let mut config = ReactivatorConfig::for_testing("orders", &["p0"]);
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.source_id, "inventory");
        assert_eq!(config.settings.publisher.pubsub, "bus");
        assert_eq!(config.settings.publisher.dapr_port, 3600);
        assert_eq!(config.settings.publisher.dapr_host, "127.0.0.1");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReactivatorConfig::for_testing("roundtrip", &["a", "b"]);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReactivatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.source_id, "roundtrip");
        assert_eq!(parsed.partitions.len(), 2);
    }
}

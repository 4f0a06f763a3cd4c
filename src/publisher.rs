//! Change publisher: delivers notification batches to the event bus.
//!
//! Every batch for a source goes to the single topic `{source_id}-change`,
//! so the bus's per-topic ordering keeps batches from one worker in the
//! order they were published. A batch is sent as one JSON array and is
//! never split or reordered here.
//!
//! Errors are returned to the calling worker, which retries the same batch
//! and holds its cursor until a publish succeeds.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::config::PublisherConfig;
use crate::error::{ReactivatorError, Result};
use crate::model::ChangeNotification;
use async_trait::async_trait;
use tracing::debug;

/// Topic carrying all changes of one source.
pub fn topic_for(source_id: &str) -> String {
    format!("{}-change", source_id)
}

/// Sink for ordered change batches.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// Publish `batch` to the source's topic. All-or-nothing from the
    /// caller's point of view: on `Err` the whole batch must be retried.
    async fn publish(&self, source_id: &str, batch: &[ChangeNotification]) -> Result<()>;
}

/// Publishes through a Dapr sidecar's pub/sub HTTP API.
pub struct DaprPublisher {
    client: reqwest::Client,
    base_url: String,
    circuit: CircuitBreaker,
}

impl DaprPublisher {
    pub fn new(config: &PublisherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| ReactivatorError::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.publish_base_url(),
            circuit: CircuitBreaker::new("publish", CircuitConfig::from_publisher(config)),
        })
    }

    /// Full publish URL for a topic.
    pub fn publish_url(&self, topic: &str) -> String {
        format!("{}/{}", self.base_url, topic)
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    async fn send(&self, url: &str, topic: &str, batch: &[ChangeNotification]) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(batch)
            .send()
            .await
            .map_err(|e| ReactivatorError::publish(topic, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ReactivatorError::publish_msg(topic, format!("{}: {}", status, body.trim())))
    }
}

#[async_trait]
impl ChangePublisher for DaprPublisher {
    async fn publish(&self, source_id: &str, batch: &[ChangeNotification]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let topic = topic_for(source_id);
        let url = self.publish_url(&topic);

        match self.circuit.call(|| self.send(&url, &topic, batch)).await {
            Ok(()) => {
                debug!(topic = %topic, count = batch.len(), "Published batch");
                Ok(())
            }
            Err(CircuitError::Rejected) => Err(ReactivatorError::publish_msg(topic, "circuit open")),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityState, MappedChange};
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Received = Arc<Mutex<Vec<(String, String, Value)>>>;

    /// Minimal stand-in for the sidecar publish endpoint.
    async fn fake_sidecar(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/v1.0/publish/{pubsub}/{topic}",
                post(
                    |State((rx, status)): State<(Received, StatusCode)>,
                     Path((pubsub, topic)): Path<(String, String)>,
                     Json(body): Json<Value>| async move {
                        rx.lock().await.push((pubsub, topic, body));
                        status
                    },
                ),
            )
            .with_state((received.clone(), status));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.port().to_string(), received)
    }

    fn config_for(port: &str) -> PublisherConfig {
        PublisherConfig {
            dapr_host: "127.0.0.1".into(),
            dapr_port: port.parse().unwrap(),
            pubsub: "bus".into(),
            ..Default::default()
        }
    }

    fn batch(n: u64) -> Vec<ChangeNotification> {
        (1..=n)
            .map(|seq| {
                MappedChange::insert(EntityState::node(format!("n{}", seq), ["A"], Map::new()), 0)
                    .into_notification(seq, "orders", "p0", Some(format!("T{}", seq)))
            })
            .collect()
    }

    #[test]
    fn test_topic_for() {
        assert_eq!(topic_for("orders"), "orders-change");
    }

    #[tokio::test]
    async fn test_publishes_ordered_array_to_topic() {
        let (port, received) = fake_sidecar(StatusCode::NO_CONTENT).await;
        let publisher = DaprPublisher::new(&config_for(&port)).unwrap();

        publisher.publish("orders", &batch(3)).await.unwrap();

        let got = received.lock().await;
        assert_eq!(got.len(), 1);
        let (pubsub, topic, body) = &got[0];
        assert_eq!(pubsub, "bus");
        assert_eq!(topic, "orders-change");
        let seqs: Vec<u64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["sequence"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (port, received) = fake_sidecar(StatusCode::OK).await;
        let publisher = DaprPublisher::new(&config_for(&port)).unwrap();
        publisher.publish("orders", &[]).await.unwrap();
        assert!(received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_publish_error() {
        let (port, _) = fake_sidecar(StatusCode::INTERNAL_SERVER_ERROR).await;
        let publisher = DaprPublisher::new(&config_for(&port)).unwrap();

        let err = publisher.publish("orders", &batch(1)).await.unwrap_err();
        assert!(matches!(err, ReactivatorError::Publish { .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("orders-change"));
    }

    #[tokio::test]
    async fn test_unreachable_sidecar_is_retryable() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port().to_string()
        };
        let publisher = DaprPublisher::new(&config_for(&port)).unwrap();
        let err = publisher.publish("orders", &batch(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}

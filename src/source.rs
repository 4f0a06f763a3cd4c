//! Source capabilities: incremental change pulls and paged snapshots.
//!
//! A reactivator is wired to one [`ChangeSource`] per partition and one
//! [`SnapshotSource`] for bootstrap. Both are plain async traits so the
//! sync loop and the bootstrap service never know which backend they
//! talk to.
//!
//! [`HttpFeed`] is the shipped backend: a small HTTP contract that any
//! source adapter can expose.
//!
//! ```text
//! GET {base}/changes/{partition}?cursor=<token>   -> { "events": [...], "nextCursor": "..." }
//! GET {base}/changes/{partition}?from=now         -> first pull without a cursor
//! GET {base}/snapshot?page=<token>                -> { "entities": [...], "nextPage": "..." }
//! ```

use crate::config::{FeedConfig, StartFrom};
use crate::error::{ReactivatorError, Result};
use crate::mapper::RawEvent;
use crate::model::EntityState;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of one incremental pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBatch {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    /// Position after the last event. `None` means "unchanged", which is
    /// only valid for a batch without events.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl SourceBatch {
    pub fn new(events: Vec<RawEvent>, next_cursor: impl Into<String>) -> Self {
        Self {
            events,
            next_cursor: Some(next_cursor.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One page of a snapshot listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPage {
    #[serde(default)]
    pub entities: Vec<EntityState>,
    /// Token of the following page, `None` on the last page.
    #[serde(default)]
    pub next_page: Option<String>,
}

/// Incremental change feed for a single partition.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    fn partition(&self) -> &str;

    /// Where to start when no cursor has been persisted yet.
    ///
    /// `None` lets the source pick its own default position.
    fn initial_cursor(&self) -> Option<String> {
        None
    }

    /// Pull the changes after `cursor`, oldest first.
    async fn pull_since(&self, cursor: Option<&str>) -> Result<SourceBatch>;
}

/// Paged full listing of the source's current state.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn list_page(&self, page: Option<&str>) -> Result<SnapshotPage>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP feed backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Client for a source adapter's HTTP feed.
///
/// Cheap to clone; all clones share the connection pool.
#[derive(Clone)]
pub struct HttpFeed {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    start_from: StartFrom,
}

impl HttpFeed {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| ReactivatorError::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            start_from: config.start_from,
        })
    }

    /// Change source for one partition of this feed.
    pub fn partition(&self, partition: impl Into<String>) -> HttpFeedSource {
        HttpFeedSource {
            feed: self.clone(),
            partition: partition.into(),
        }
    }

    async fn get_json<T>(&self, scope: &str, url: &str, query: &[(&str, &str)]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReactivatorError::source(scope, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(scope, status, body.trim()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ReactivatorError::source(scope, format!("Malformed feed response: {}", e)))
    }
}

/// Map a non-success feed status onto the error taxonomy.
fn classify_status(scope: &str, status: StatusCode, body: &str) -> ReactivatorError {
    let message = format!("{}: {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ReactivatorError::Auth(format!("{} ({})", message, scope))
        }
        StatusCode::TOO_MANY_REQUESTS => ReactivatorError::source(scope, message),
        s if s.is_server_error() => ReactivatorError::source(scope, message),
        _ => ReactivatorError::Config(format!("Feed rejected request for {}: {}", scope, message)),
    }
}

#[async_trait]
impl SnapshotSource for HttpFeed {
    async fn list_page(&self, page: Option<&str>) -> Result<SnapshotPage> {
        let url = format!("{}/snapshot", self.base_url);
        let query: Vec<(&str, &str)> = page.map(|p| vec![("page", p)]).unwrap_or_default();
        let page: SnapshotPage = self.get_json("snapshot", &url, &query).await?;
        debug!(entities = page.entities.len(), has_more = page.next_page.is_some(), "Fetched snapshot page");
        Ok(page)
    }
}

/// A single partition of an [`HttpFeed`].
pub struct HttpFeedSource {
    feed: HttpFeed,
    partition: String,
}

#[async_trait]
impl ChangeSource for HttpFeedSource {
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn pull_since(&self, cursor: Option<&str>) -> Result<SourceBatch> {
        let url = format!("{}/changes/{}", self.feed.base_url, self.partition);
        let query = match cursor {
            Some(c) => vec![("cursor", c)],
            None => match self.feed.start_from {
                StartFrom::Now => vec![("from", "now")],
                StartFrom::Beginning => vec![("from", "beginning")],
            },
        };
        self.feed.get_json(&self.partition, &url, &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Map};
    use std::collections::HashMap;

    async fn changes(
        Path(partition): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        match partition.as_str() {
            "locked" => return AxumStatus::FORBIDDEN.into_response(),
            "flaky" => return AxumStatus::BAD_GATEWAY.into_response(),
            "gone" => return AxumStatus::NOT_FOUND.into_response(),
            _ => {}
        }
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let position = query
            .get("cursor")
            .cloned()
            .or_else(|| query.get("from").map(|f| format!("from-{}", f)))
            .unwrap_or_default();
        Json(json!({
            "events": [{"kind": "heartbeat"}],
            "nextCursor": format!("{}|{}|{}", partition, position, auth),
        }))
        .into_response()
    }

    async fn snapshot(Query(query): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        match query.get("page").map(String::as_str) {
            None => Json(json!({
                "entities": [{"id": "a", "labels": ["Pod"], "properties": {}}],
                "nextPage": "2",
            })),
            _ => Json(json!({
                "entities": [{"id": "e", "labels": ["OWNS"], "properties": {}, "startId": "a", "endId": "b"}],
            })),
        }
    }

    async fn fake_feed() -> String {
        let app = Router::new()
            .route("/changes/{partition}", get(changes))
            .route("/snapshot", get(snapshot));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn feed(base_url: String, start_from: StartFrom) -> HttpFeed {
        HttpFeed::new(&FeedConfig {
            base_url,
            bearer_token: Some("s3cret".into()),
            start_from,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_with_cursor_and_token() {
        let feed = feed(fake_feed().await, StartFrom::Now);
        let source = feed.partition("p0");
        assert_eq!(source.partition(), "p0");
        assert_eq!(source.initial_cursor(), None);

        let batch = source.pull_since(Some("T4")).await.unwrap();
        assert_eq!(batch.events, vec![RawEvent::Heartbeat]);
        assert_eq!(batch.next_cursor.as_deref(), Some("p0|T4|Bearer s3cret"));
    }

    #[tokio::test]
    async fn test_pull_without_cursor_uses_start_from() {
        let base = fake_feed().await;
        let now = feed(base.clone(), StartFrom::Now).partition("p0");
        let batch = now.pull_since(None).await.unwrap();
        assert!(batch.next_cursor.unwrap().starts_with("p0|from-now|"));

        let beginning = feed(base, StartFrom::Beginning).partition("p0");
        let batch = beginning.pull_since(None).await.unwrap();
        assert!(batch.next_cursor.unwrap().starts_with("p0|from-beginning|"));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let feed = feed(fake_feed().await, StartFrom::Now);

        let auth = feed.partition("locked").pull_since(None).await.unwrap_err();
        assert!(matches!(auth, ReactivatorError::Auth(_)));
        assert!(auth.is_fatal());

        let flaky = feed.partition("flaky").pull_since(None).await.unwrap_err();
        assert!(matches!(flaky, ReactivatorError::Source { .. }));
        assert!(flaky.is_retryable());

        let gone = feed.partition("gone").pull_since(None).await.unwrap_err();
        assert!(matches!(gone, ReactivatorError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_feed_is_retryable() {
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let source = feed(format!("http://127.0.0.1:{}", port), StartFrom::Now).partition("p0");
        let err = source.pull_since(None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_snapshot_pages() {
        let feed = feed(fake_feed().await, StartFrom::Now);

        let first = feed.list_page(None).await.unwrap();
        assert_eq!(first.entities, vec![EntityState::node("a", ["Pod"], Map::new())]);
        assert_eq!(first.next_page.as_deref(), Some("2"));

        let second = feed.list_page(Some("2")).await.unwrap();
        assert!(second.entities[0].is_relation());
        assert!(second.next_page.is_none());
    }

    #[test]
    fn test_source_batch_wire_shape() {
        let batch: SourceBatch =
            serde_json::from_str(r#"{"events":[{"kind":"heartbeat"}],"nextCursor":"T1"}"#).unwrap();
        assert_eq!(batch, SourceBatch::new(vec![RawEvent::Heartbeat], "T1"));
        assert!(SourceBatch::empty().is_empty());
    }
}

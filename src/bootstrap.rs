//! Bootstrap: point-in-time snapshot of the source filtered by labels.
//!
//! A new continuous query needs the current state of every node and
//! relation it cares about before it can apply live changes. The snapshot
//! is read page by page from a [`SnapshotSource`] and filtered by label
//! intersection; it never touches worker cursors.
//!
//! ```text
//! list_page(None) ─► page 1 ─► list_page("2") ─► page 2 ─► ... ─► next_page = None
//!                      │                           │
//!                      └── filter by labels ───────┴──► EntityState stream
//! ```

use crate::error::{ReactivatorError, Result};
use crate::metrics;
use crate::model::{BootstrapSnapshot, EntityState, SubscriptionRequest};
use crate::source::SnapshotSource;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Paging position for the unfold.
enum Paging {
    Next(Option<String>),
    Done,
}

#[derive(Clone)]
pub struct BootstrapService {
    source: Arc<dyn SnapshotSource>,
}

impl BootstrapService {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self { source }
    }

    /// Lazily page through the snapshot, yielding entities that match.
    ///
    /// Nodes match when they share a label with `node_labels`, relations
    /// when they share one with `rel_labels`. An empty set matches nothing
    /// of that kind. Each call starts again from the first page.
    ///
    /// A failed page ends the stream with a `Bootstrap` error.
    pub fn stream(
        &self,
        node_labels: BTreeSet<String>,
        rel_labels: BTreeSet<String>,
    ) -> BoxStream<'static, Result<EntityState>> {
        let source = Arc::clone(&self.source);

        stream::try_unfold(Paging::Next(None), move |paging| {
            let source = Arc::clone(&source);
            async move {
                let token = match paging {
                    Paging::Next(token) => token,
                    Paging::Done => return Ok(None),
                };

                let page = match source.list_page(token.as_deref()).await {
                    Ok(page) => page,
                    Err(e) => {
                        return Err(ReactivatorError::Bootstrap(format!(
                            "listing page {} failed: {}",
                            token.as_deref().unwrap_or("<first>"),
                            e
                        )));
                    }
                };
                debug!(page = ?token, entities = page.entities.len(), "Snapshot page read");

                let next = match page.next_page {
                    Some(next) if token.as_deref() == Some(next.as_str()) => {
                        return Err(ReactivatorError::Bootstrap(format!(
                            "page token '{}' did not advance",
                            next
                        )));
                    }
                    Some(next) => Paging::Next(Some(next)),
                    None => Paging::Done,
                };
                Ok(Some((page.entities, next)))
            }
        })
        .map_ok(|entities| stream::iter(entities.into_iter().map(Ok)))
        .try_flatten()
        .try_filter(move |entity| {
            let wanted = if entity.is_relation() { &rel_labels } else { &node_labels };
            futures::future::ready(entity.has_any_label(wanted))
        })
        .boxed()
    }

    /// Collect the full filtered snapshot. No partial result on error.
    pub async fn acquire(&self, request: &SubscriptionRequest) -> Result<BootstrapSnapshot> {
        let start = Instant::now();
        let collected = self
            .stream(request.node_labels.clone(), request.rel_labels.clone())
            .try_fold(BootstrapSnapshot::default(), |mut snapshot, entity| async move {
                snapshot.push(entity);
                Ok(snapshot)
            })
            .await;

        match collected {
            Ok(snapshot) => {
                metrics::record_bootstrap(true, snapshot.len(), start.elapsed());
                info!(
                    query_id = %request.query_id,
                    nodes = snapshot.nodes.len(),
                    rels = snapshot.rels.len(),
                    "Bootstrap complete"
                );
                Ok(snapshot)
            }
            Err(e) => {
                metrics::record_bootstrap(false, 0, start.elapsed());
                warn!(query_id = %request.query_id, error = %e, "Bootstrap failed");
                Err(e)
            }
        }
    }
}

//! Canonical graph-change types.
//!
//! Everything a reactivator emits is a [`ChangeNotification`] carrying
//! [`EntityState`] before/after images. The shape invariants
//!
//! ```text
//! op = Insert  ⇒ before = null, after ≠ null
//! op = Update  ⇒ before ≠ null, after ≠ null
//! op = Delete  ⇒ before ≠ null, after = null
//! ```
//!
//! are enforced at construction: [`MappedChange`] can only be built through
//! `insert`/`update`/`delete`, and a notification can only be produced from a
//! `MappedChange`. Notifications read off the wire are checked with
//! [`ChangeNotification::validate`].

use crate::error::{ReactivatorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// `source.table` for node changes.
pub const TABLE_NODE: &str = "node";
/// `source.table` for relationship changes.
pub const TABLE_REL: &str = "rel";
/// `source.table` for subscription lifecycle control events.
pub const TABLE_SUBSCRIPTION: &str = "SourceSubscription";
/// `source.db` of subscription control events.
pub const CONTROL_DB: &str = "Drasi";

/// Change operation. Serialized as the single-letter codes consumers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "i"),
            ChangeOp::Update => write!(f, "u"),
            ChangeOp::Delete => write!(f, "d"),
        }
    }
}

/// A vertex or edge as seen by the query layer.
///
/// Untagged on the wire: an object with `startId`/`endId` is a relation,
/// anything else a node. `Relation` is listed first so deserialization
/// doesn't collapse relations into nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityState {
    Relation {
        id: String,
        #[serde(default)]
        labels: BTreeSet<String>,
        #[serde(default)]
        properties: Map<String, Value>,
        #[serde(rename = "startId")]
        start_id: String,
        #[serde(rename = "endId")]
        end_id: String,
    },
    Node {
        id: String,
        #[serde(default)]
        labels: BTreeSet<String>,
        #[serde(default)]
        properties: Map<String, Value>,
    },
}

impl EntityState {
    pub fn node<I, S>(id: impl Into<String>, labels: I, properties: Map<String, Value>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EntityState::Node {
            id: id.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        }
    }

    pub fn relation<I, S>(
        id: impl Into<String>,
        labels: I,
        properties: Map<String, Value>,
        start_id: impl Into<String>,
        end_id: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EntityState::Relation {
            id: id.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
            start_id: start_id.into(),
            end_id: end_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityState::Node { id, .. } | EntityState::Relation { id, .. } => id,
        }
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        match self {
            EntityState::Node { labels, .. } | EntityState::Relation { labels, .. } => labels,
        }
    }

    pub fn properties(&self) -> &Map<String, Value> {
        match self {
            EntityState::Node { properties, .. } | EntityState::Relation { properties, .. } => {
                properties
            }
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, EntityState::Relation { .. })
    }

    /// True if this entity carries at least one of `wanted`.
    pub fn has_any_label(&self, wanted: &BTreeSet<String>) -> bool {
        // Iterate the smaller set.
        let labels = self.labels();
        if labels.len() <= wanted.len() {
            labels.iter().any(|l| wanted.contains(l))
        } else {
            wanted.iter().any(|l| labels.contains(l))
        }
    }

    fn table(&self) -> &'static str {
        if self.is_relation() {
            TABLE_REL
        } else {
            TABLE_NODE
        }
    }
}

/// Check the op/before/after shape invariant.
pub fn validate_shape(
    op: ChangeOp,
    before: Option<&EntityState>,
    after: Option<&EntityState>,
) -> Result<()> {
    let ok = match op {
        ChangeOp::Insert => before.is_none() && after.is_some(),
        ChangeOp::Update => before.is_some() && after.is_some(),
        ChangeOp::Delete => before.is_some() && after.is_none(),
    };
    if ok {
        Ok(())
    } else {
        Err(ReactivatorError::Mapping(format!(
            "op '{}' with before={} after={} violates change shape",
            op,
            before.is_some(),
            after.is_some()
        )))
    }
}

/// Output of the change mapper: a well-formed change without sequence or
/// source metadata, which the worker stamps on afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedChange {
    op: ChangeOp,
    ts_ms: u64,
    table: String,
    before: Option<EntityState>,
    after: Option<EntityState>,
}

impl MappedChange {
    pub fn insert(after: EntityState, ts_ms: u64) -> Self {
        Self {
            op: ChangeOp::Insert,
            ts_ms,
            table: after.table().to_string(),
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: EntityState, after: EntityState, ts_ms: u64) -> Self {
        Self {
            op: ChangeOp::Update,
            ts_ms,
            table: after.table().to_string(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(before: EntityState, ts_ms: u64) -> Self {
        Self {
            op: ChangeOp::Delete,
            ts_ms,
            table: before.table().to_string(),
            before: Some(before),
            after: None,
        }
    }

    /// Override `source.table` (control events).
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn op(&self) -> ChangeOp {
        self.op
    }

    pub fn ts_ms(&self) -> u64 {
        self.ts_ms
    }

    pub fn before(&self) -> Option<&EntityState> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&EntityState> {
        self.after.as_ref()
    }

    /// Stamp sequence and provenance.
    pub fn into_notification(
        self,
        sequence: u64,
        db: impl Into<String>,
        partition: impl Into<String>,
        cursor: Option<String>,
    ) -> ChangeNotification {
        ChangeNotification {
            op: self.op,
            ts_ms: self.ts_ms,
            sequence,
            source: SourceInfo {
                db: db.into(),
                partition: partition.into(),
                cursor,
                table: self.table,
                ts_ms: self.ts_ms,
            },
            before: self.before,
            after: self.after,
        }
    }
}

/// Provenance of a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Source id.
    pub db: String,
    /// Entity or partition the change was read from.
    pub partition: String,
    /// Resume token at the end of the batch this change was pulled in.
    /// Every change in one batch carries the same value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub table: String,
    /// Source-side timestamp (ms since epoch).
    pub ts_ms: u64,
}

/// Canonical change record published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub op: ChangeOp,
    pub ts_ms: u64,
    /// Strictly increasing within one process lifetime. Not unique across restarts.
    pub sequence: u64,
    pub source: SourceInfo,
    pub before: Option<EntityState>,
    pub after: Option<EntityState>,
}

impl ChangeNotification {
    /// Check the shape invariant on a notification that didn't come from a
    /// [`MappedChange`] (e.g. one read back off the wire).
    pub fn validate(&self) -> Result<()> {
        validate_shape(self.op, self.before.as_ref(), self.after.as_ref())
    }

    /// Id of the entity this change concerns.
    pub fn entity_id(&self) -> Option<&str> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(EntityState::id)
    }
}

/// Point-in-time listing returned by acquire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSnapshot {
    pub nodes: Vec<EntityState>,
    pub rels: Vec<EntityState>,
}

impl BootstrapSnapshot {
    pub fn push(&mut self, entity: EntityState) {
        if entity.is_relation() {
            self.rels.push(entity);
        } else {
            self.nodes.push(entity);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.rels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.rels.is_empty()
    }
}

/// Query registration request from the query layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub query_id: String,
    pub query_node_id: String,
    #[serde(default)]
    pub node_labels: BTreeSet<String>,
    #[serde(default)]
    pub rel_labels: BTreeSet<String>,
}

impl SubscriptionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.query_id.trim().is_empty() {
            return Err(ReactivatorError::InvalidRequest("queryId is required".into()));
        }
        if self.query_node_id.trim().is_empty() {
            return Err(ReactivatorError::InvalidRequest("queryNodeId is required".into()));
        }
        Ok(())
    }

    /// Control-plane node representing this subscription.
    pub fn control_entity(&self) -> EntityState {
        let mut props = Map::new();
        props.insert("queryId".into(), Value::String(self.query_id.clone()));
        props.insert("queryNodeId".into(), Value::String(self.query_node_id.clone()));
        props.insert(
            "nodeLabels".into(),
            Value::Array(self.node_labels.iter().cloned().map(Value::String).collect()),
        );
        props.insert(
            "relLabels".into(),
            Value::Array(self.rel_labels.iter().cloned().map(Value::String).collect()),
        );
        EntityState::node(
            subscription_entity_id(&self.query_node_id, &self.query_id),
            [TABLE_SUBSCRIPTION],
            props,
        )
    }
}

pub fn subscription_entity_id(query_node_id: &str, query_id: &str) -> String {
    format!("{}.{}", query_node_id, query_id)
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

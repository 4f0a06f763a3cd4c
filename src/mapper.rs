//! Change mapper: raw source events to canonical changes.
//!
//! [`ChangeMapper::map`] is pure. It reads no clock and touches no I/O; the
//! caller passes the receive time as the timestamp fallback. Each raw event
//! yields exactly one [`MappedChange`] or nothing (heartbeats, bookmarks).
//!
//! Payloads that parse but don't fit the expected shape are still mapped,
//! with the unrecognized fields carried through as properties. Only payloads
//! that cannot be interpreted at all (non-JSON bodies, objects with no
//! usable identity) produce [`ReactivatorError::Mapping`].
//!
//! # Source kinds
//!
//! | Kind | Identity | Labels | Op source |
//! |------|----------|--------|-----------|
//! | Kubernetes | `namespace/name` | `kind` | watch event type, diffed against `previous` |
//! | Event Hub | body `id` | body `labels` | body `op` |
//! | Dataverse | record id | entity name | change type |
//! | Relational | `id` column | table name | Debezium `op` |

use crate::error::{ReactivatorError, Result};
use crate::model::{EntityState, MappedChange};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Relationship label for pod-to-node scheduling bindings.
pub const SCHEDULED_ON: &str = "SCHEDULED_ON";

/// Label for Event Hub messages that don't carry a graph shape.
pub const EVENT_HUB_MESSAGE: &str = "EventHubMessage";

/// A source-native event, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    /// Kubernetes watch event. `previous` is the last object seen for the
    /// same resource, supplied by the watcher since watch events carry only
    /// the new state.
    Kubernetes {
        event_type: WatchEventType,
        object: Value,
        #[serde(default)]
        previous: Option<Value>,
    },
    /// Event Hub partition event with a UTF-8 body.
    EventHub {
        partition: String,
        sequence_number: i64,
        enqueued_time_ms: u64,
        body: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    /// Dataverse entity change record.
    Dataverse {
        entity: String,
        change: DataverseChange,
    },
    /// Debezium-shaped relational CDC record.
    Relational {
        op: RelationalOp,
        table: String,
        #[serde(default)]
        before: Option<Value>,
        #[serde(default)]
        after: Option<Value>,
        ts_ms: u64,
    },
    /// Liveness tick from the source. Maps to nothing.
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DataverseChange {
    NewOrUpdated {
        id: String,
        #[serde(default)]
        attributes: Map<String, Value>,
        /// Prior attributes, when the feed supplies them.
        #[serde(default)]
        previous: Option<Map<String, Value>>,
    },
    RemovedOrDeleted {
        id: String,
        #[serde(default)]
        attributes: Option<Map<String, Value>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationalOp {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    /// Snapshot read.
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "t")]
    Truncate,
}

/// Deterministic id for an edge derived from its endpoints.
pub fn edge_id(start: &str, label: &str, end: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", start, label, end).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(32);
    id
}

/// Parse an RFC 3339 timestamp to epoch milliseconds.
fn rfc3339_ms(value: Option<&Value>) -> Option<u64> {
    let raw = value?.as_str()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}

/// Stringify an identity value (ids are often numeric in databases).
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Stateless mapper shared by every worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeMapper;

impl ChangeMapper {
    pub fn new() -> Self {
        Self
    }

    /// Map one raw event. `received_ms` is used when the payload carries no
    /// usable timestamp of its own.
    pub fn map(&self, event: &RawEvent, received_ms: u64) -> Result<Option<MappedChange>> {
        match event {
            RawEvent::Kubernetes {
                event_type,
                object,
                previous,
            } => map_kubernetes(*event_type, object, previous.as_ref(), received_ms),
            RawEvent::EventHub {
                partition,
                sequence_number,
                enqueued_time_ms,
                body,
                properties,
            } => map_event_hub(partition, *sequence_number, *enqueued_time_ms, body, properties)
                .map(Some),
            RawEvent::Dataverse { entity, change } => {
                Ok(Some(map_dataverse(entity, change, received_ms)))
            }
            RawEvent::Relational {
                op,
                table,
                before,
                after,
                ts_ms,
            } => map_relational(*op, table, before.as_ref(), after.as_ref(), *ts_ms),
            RawEvent::Heartbeat => Ok(None),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Kubernetes
// ═══════════════════════════════════════════════════════════════════════════════

const K8S_ENVELOPE: [&str; 3] = ["apiVersion", "kind", "metadata"];

fn k8s_entity(object: &Value) -> Result<EntityState> {
    let obj = object
        .as_object()
        .ok_or_else(|| ReactivatorError::Mapping("kubernetes object is not a JSON object".into()))?;
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("Resource")
        .to_string();
    let meta = obj.get("metadata").and_then(Value::as_object);
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ReactivatorError::Mapping(format!("{} has no metadata.name", kind)))?;
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(Value::as_str);

    let id = match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    };

    if kind == "Binding" {
        // Pod scheduled onto a node.
        let target = obj
            .get("target")
            .and_then(|t| t.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| ReactivatorError::Mapping("Binding has no target.name".into()))?;
        let mut props = Map::new();
        if let Some(target_kind) = obj.get("target").and_then(|t| t.get("kind")) {
            props.insert("targetKind".into(), target_kind.clone());
        }
        return Ok(EntityState::relation(
            edge_id(&id, SCHEDULED_ON, target),
            [SCHEDULED_ON],
            props,
            id,
            target,
        ));
    }

    let mut props = Map::new();
    props.insert("name".into(), Value::String(name.to_string()));
    if let Some(ns) = namespace {
        props.insert("namespace".into(), Value::String(ns.to_string()));
    }
    if let Some(meta) = meta {
        for key in ["uid", "resourceVersion", "labels", "annotations", "creationTimestamp"] {
            if let Some(v) = meta.get(key) {
                props.insert(key.into(), v.clone());
            }
        }
    }
    // spec, status, and anything else a CRD carries.
    for (k, v) in obj {
        if !K8S_ENVELOPE.contains(&k.as_str()) {
            props.insert(k.clone(), v.clone());
        }
    }

    Ok(EntityState::node(id, [kind], props))
}

fn map_kubernetes(
    event_type: WatchEventType,
    object: &Value,
    previous: Option<&Value>,
    received_ms: u64,
) -> Result<Option<MappedChange>> {
    if event_type == WatchEventType::Bookmark {
        return Ok(None);
    }
    let entity = k8s_entity(object)?;
    let change = match event_type {
        WatchEventType::Added => MappedChange::insert(entity, received_ms),
        WatchEventType::Modified => match previous {
            Some(prev) => MappedChange::update(k8s_entity(prev)?, entity, received_ms),
            // First sighting after a restart: treat as upsert.
            None => MappedChange::insert(entity, received_ms),
        },
        WatchEventType::Deleted => {
            let ts = rfc3339_ms(object.pointer("/metadata/deletionTimestamp")).unwrap_or(received_ms);
            MappedChange::delete(entity, ts)
        }
        WatchEventType::Bookmark => return Ok(None),
    };
    Ok(Some(change))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Hub
// ═══════════════════════════════════════════════════════════════════════════════

/// Build an entity from a `{id, labels, properties, startId?, endId?}` object.
fn graph_entity(obj: &Map<String, Value>) -> Option<EntityState> {
    let id = obj.get("id").and_then(id_string)?;
    let labels: Vec<String> = match obj.get("labels") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|l| match l {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };
    let properties = match obj.get("properties") {
        Some(Value::Object(p)) => p.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut p = Map::new();
            p.insert("value".into(), other.clone());
            p
        }
    };
    let start = obj.get("startId").and_then(id_string);
    let end = obj.get("endId").and_then(id_string);
    Some(match (start, end) {
        (Some(s), Some(e)) => EntityState::relation(id, labels, properties, s, e),
        _ => EntityState::node(id, labels, properties),
    })
}

fn with_hub_metadata(
    entity: EntityState,
    partition: &str,
    sequence_number: i64,
    app_props: &Map<String, Value>,
) -> EntityState {
    if app_props.is_empty() {
        return entity;
    }
    let mut meta = Map::new();
    meta.insert("partition".into(), Value::String(partition.to_string()));
    meta.insert("sequenceNumber".into(), Value::from(sequence_number));
    meta.insert("properties".into(), Value::Object(app_props.clone()));
    match entity {
        EntityState::Node {
            id,
            labels,
            mut properties,
        } => {
            properties.insert("_eventhub".into(), Value::Object(meta));
            EntityState::Node { id, labels, properties }
        }
        EntityState::Relation {
            id,
            labels,
            mut properties,
            start_id,
            end_id,
        } => {
            properties.insert("_eventhub".into(), Value::Object(meta));
            EntityState::Relation {
                id,
                labels,
                properties,
                start_id,
                end_id,
            }
        }
    }
}

fn map_event_hub(
    partition: &str,
    sequence_number: i64,
    enqueued_time_ms: u64,
    body: &str,
    app_props: &Map<String, Value>,
) -> Result<MappedChange> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        ReactivatorError::Mapping(format!(
            "event hub body at {}:{} is not JSON: {}",
            partition, sequence_number, e
        ))
    })?;

    let shaped = value.as_object().and_then(|obj| {
        let op = obj
            .get("op")
            .and_then(Value::as_str)
            .filter(|op| matches!(*op, "i" | "u" | "d"))?
            .to_string();
        let entity = graph_entity(obj)?;
        let before = obj.get("before").and_then(Value::as_object).and_then(graph_entity);
        Some((op, entity, before))
    });

    let change = match shaped {
        Some((op, entity, before)) => {
            let entity = with_hub_metadata(entity, partition, sequence_number, app_props);
            match (op.as_str(), before) {
                ("d", _) => MappedChange::delete(entity, enqueued_time_ms),
                ("u", Some(before)) => MappedChange::update(before, entity, enqueued_time_ms),
                _ => MappedChange::insert(entity, enqueued_time_ms),
            }
        }
        None => {
            // No recognizable graph shape: carry the whole body.
            let properties = match value {
                Value::Object(obj) => obj,
                other => {
                    let mut p = Map::new();
                    p.insert("value".into(), other);
                    p
                }
            };
            let entity = EntityState::node(
                format!("{}-{}", partition, sequence_number),
                [EVENT_HUB_MESSAGE],
                properties,
            );
            MappedChange::insert(
                with_hub_metadata(entity, partition, sequence_number, app_props),
                enqueued_time_ms,
            )
        }
    };
    Ok(change)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dataverse
// ═══════════════════════════════════════════════════════════════════════════════

fn map_dataverse(entity: &str, change: &DataverseChange, received_ms: u64) -> MappedChange {
    match change {
        DataverseChange::NewOrUpdated {
            id,
            attributes,
            previous,
        } => {
            let ts = rfc3339_ms(attributes.get("modifiedon")).unwrap_or(received_ms);
            let after = EntityState::node(id.clone(), [entity], attributes.clone());
            match previous {
                Some(prev) => MappedChange::update(
                    EntityState::node(id.clone(), [entity], prev.clone()),
                    after,
                    ts,
                ),
                None => MappedChange::insert(after, ts),
            }
        }
        DataverseChange::RemovedOrDeleted { id, attributes } => {
            let attributes = attributes.clone().unwrap_or_default();
            let ts = rfc3339_ms(attributes.get("deletetime")).unwrap_or(received_ms);
            MappedChange::delete(EntityState::node(id.clone(), [entity], attributes), ts)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Relational (Debezium)
// ═══════════════════════════════════════════════════════════════════════════════

fn row_entity(table: &str, row: &Value) -> Result<EntityState> {
    let obj = row
        .as_object()
        .ok_or_else(|| ReactivatorError::Mapping(format!("{} row is not an object", table)))?;
    let id = obj
        .get("id")
        .and_then(id_string)
        .or_else(|| {
            obj.iter()
                .find(|(k, _)| k.ends_with("_id") || k.ends_with("Id"))
                .and_then(|(_, v)| id_string(v))
        })
        .ok_or_else(|| ReactivatorError::Mapping(format!("{} row has no id column", table)))?;
    Ok(EntityState::node(id, [table], obj.clone()))
}

fn map_relational(
    op: RelationalOp,
    table: &str,
    before: Option<&Value>,
    after: Option<&Value>,
    ts_ms: u64,
) -> Result<Option<MappedChange>> {
    let missing = |side: &str| {
        ReactivatorError::Mapping(format!("{:?} on {} has no '{}' row", op, table, side))
    };
    let change = match op {
        RelationalOp::Create | RelationalOp::Read => {
            MappedChange::insert(row_entity(table, after.ok_or_else(|| missing("after"))?)?, ts_ms)
        }
        RelationalOp::Update => {
            let after = row_entity(table, after.ok_or_else(|| missing("after"))?)?;
            match before {
                Some(b) if !b.is_null() => MappedChange::update(row_entity(table, b)?, after, ts_ms),
                _ => MappedChange::insert(after, ts_ms),
            }
        }
        RelationalOp::Delete => {
            MappedChange::delete(row_entity(table, before.ok_or_else(|| missing("before"))?)?, ts_ms)
        }
        // Table-level event with no row image.
        RelationalOp::Truncate => return Ok(None),
    };
    Ok(Some(change))
}

//! Serializer
//!
//! Converts a policy-gated [`Event`] into opaque bytes plus the tenant token
//! that routes it. This is a pluggable collaborator: the crate ships two
//! canonical implementations (a compact binary encoder and an
//! application-insights-style JSON encoder) but callers may supply their
//! own by implementing [`Serializer`].

use crate::error::TelemetryError;
use crate::event::{Event, Value};
use std::collections::BTreeMap;

/// A fully serialized event: opaque bytes, the tenant that owns it, its
/// priority (used by the offline store for queue placement), and the size
/// of the record it was built from (diagnostic only).
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedRecord {
    pub bytes: Vec<u8>,
    pub tenant_token: String,
    pub priority: crate::event::Priority,
    pub original_record_size: usize,
}

/// Converts an [`Event`] into wire-ready bytes. Implementations must be
/// deterministic: the same event always serializes to the same bytes.
pub trait Serializer: Send + Sync {
    fn serialize(&self, event: &Event) -> Result<SerializedRecord, TelemetryError>;
}

fn record_size(event: &Event) -> usize {
    event.name.len()
        + event.tenant_token.len()
        + event
            .properties
            .iter()
            .map(|(k, v)| k.len() + value_size(&v.value))
            .sum::<usize>()
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Int64(_) | Value::TimeTicks(_) => 8,
        Value::Float64(_) => 8,
        Value::Bool(_) => 1,
        Value::Guid(_) => 16,
    }
}

/// A compact, general-purpose binary encoder. Frames each event as a small
/// length-prefixed record: name, timestamp, and sorted properties. Chosen
/// for size over human-readability; not the wire format any real collector
/// speaks, but deterministic and byte-stable, which is all the pipeline
/// requires.
#[derive(Debug, Default)]
pub struct CompactSerializer;

impl Serializer for CompactSerializer {
    fn serialize(&self, event: &Event) -> Result<SerializedRecord, TelemetryError> {
        let mut bytes = Vec::new();
        write_str(&mut bytes, &event.name);
        bytes.extend_from_slice(&event.timestamp.timestamp_millis().to_le_bytes());
        bytes.push(event.properties.len() as u8);
        for (name, tagged) in &event.properties {
            write_str(&mut bytes, name);
            write_value(&mut bytes, &tagged.value);
        }

        Ok(SerializedRecord {
            bytes,
            tenant_token: event.tenant_token.clone(),
            priority: event.priority,
            original_record_size: record_size(event),
        })
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::String(s) => {
            out.push(0);
            write_str(out, s);
        }
        Value::Int64(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float64(v) => {
            out.push(2);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Bool(v) => {
            out.push(3);
            out.push(*v as u8);
        }
        Value::Guid(v) => {
            out.push(4);
            out.extend_from_slice(v.as_bytes());
        }
        Value::TimeTicks(v) => {
            out.push(5);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// An application-insights-style JSON encoder: each event becomes a single
/// JSON object with `name`, `time`, and a flattened `data.baseData`
/// properties map. PII-tagged properties are rendered with a `_kind`
/// sibling field when the event's policy marked (rather than dropped) PII.
#[derive(Debug, Default)]
pub struct AppInsightsJsonSerializer;

impl Serializer for AppInsightsJsonSerializer {
    fn serialize(&self, event: &Event) -> Result<SerializedRecord, TelemetryError> {
        let mut properties = BTreeMap::new();
        for (name, tagged) in &event.properties {
            properties.insert(name.clone(), json_value(&tagged.value));
            if tagged.pii.is_pii() {
                properties.insert(format!("{name}_kind"), serde_json::json!(format!("{:?}", tagged.pii)));
            }
        }

        let document = serde_json::json!({
            "name": event.name,
            "time": event.timestamp.to_rfc3339(),
            "iKey": event.tenant_token,
            "data": { "baseData": properties },
        });

        let bytes = serde_json::to_vec(&document).map_err(|e| TelemetryError::SerializeError {
            event_name: event.name.clone(),
            reason: e.to_string(),
        })?;

        Ok(SerializedRecord {
            bytes,
            tenant_token: event.tenant_token.clone(),
            priority: event.priority,
            original_record_size: record_size(event),
        })
    }
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::String(s) => serde_json::json!(s),
        Value::Int64(v) => serde_json::json!(v),
        Value::Float64(v) => serde_json::json!(v),
        Value::Bool(v) => serde_json::json!(v),
        Value::Guid(v) => serde_json::json!(v.to_string()),
        Value::TimeTicks(v) => serde_json::json!(v),
    }
}

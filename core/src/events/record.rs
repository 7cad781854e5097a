//! The log record shape shared by the sink, the broadcaster and every
//! transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Well-known values of [`LogRecord::source`]. The field is free text;
/// these are just the producers that exist in this workspace.
pub mod source {
    pub const SESSION: &str = "session";
    pub const NVP: &str = "nvp";
    pub const API_KEYS: &str = "api-keys";
    pub const SERVER: &str = "server";
}

/// A stored, redacted event.
///
/// Serialized flat: `{"id": .., "ts": .., "source": .., "type": .., ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// An event before the hub has stamped and redacted it.
#[derive(Debug, Clone)]
pub struct NewRecord {
    source: String,
    kind: String,
    fields: Map<String, Value>,
}

impl NewRecord {
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Attach an event-specific field. Values that fail to serialize are
    /// stored as a descriptive string rather than dropping the event.
    pub fn field(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| Value::String(format!("<unserializable: {e}>")));
        self.fields.insert(name.into(), value);
        self
    }

    pub(crate) fn stamp(self) -> LogRecord {
        LogRecord {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            source: self.source,
            kind: self.kind,
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamped_records_get_unique_ids() {
        let a = NewRecord::new(source::NVP, "request").stamp();
        let b = NewRecord::new(source::NVP, "request").stamp();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn record_serializes_flat() {
        let record = NewRecord::new(source::SESSION, "credentials_set")
            .field("env", "live")
            .stamp();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["source"], "session");
        assert_eq!(json["type"], "credentials_set");
        assert_eq!(json["env"], "live");
        assert!(json["id"].is_string());
        assert!(json["ts"].is_string());

        let back: LogRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}

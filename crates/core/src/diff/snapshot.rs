//! Normalized content snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name to value map of one content record.
pub type FieldMap = BTreeMap<String, Value>;

/// A version of a content record as seen at sync time.
///
/// A missing snapshot is equivalent to [`Snapshot::default`], an empty record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub data: FieldMap,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: FieldMap,
}

impl Snapshot {
    /// Create a snapshot from a field map with no hash, timestamp or metadata.
    pub fn from_data(data: FieldMap) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Attach a content hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Normalize an optional snapshot into an owned one.
    pub fn normalize(snapshot: Option<&Snapshot>) -> Snapshot {
        snapshot.cloned().unwrap_or_default()
    }

    /// Parse a JSON document as a snapshot.
    ///
    /// Accepts either a full `{data, hash, timestamp, metadata}` envelope or a
    /// bare object of fields. An object is treated as an envelope only when it
    /// has an object-valued `data` key and no keys outside the envelope.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        const ENVELOPE_KEYS: [&str; 4] = ["data", "hash", "timestamp", "metadata"];

        let is_envelope = match &value {
            Value::Object(map) => {
                matches!(map.get("data"), Some(Value::Object(_)))
                    && map.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str()))
            }
            _ => false,
        };

        if is_envelope {
            serde_json::from_value(value)
        } else {
            let data: FieldMap = serde_json::from_value(value)?;
            Ok(Self::from_data(data))
        }
    }

    /// Field names present in this snapshot.
    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }
}

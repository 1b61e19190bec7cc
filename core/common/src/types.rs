//! Common types used throughout fieldsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of record that takes part in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Inspection,
    Property,
    Photo,
}

impl RecordType {
    /// Every syncable record type, in the order the engine visits them.
    pub const ALL: [RecordType; 3] = [
        RecordType::Inspection,
        RecordType::Property,
        RecordType::Photo,
    ];

    /// Get the lowercase name used on the wire and in persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Inspection => "inspection",
            RecordType::Property => "property",
            RecordType::Photo => "photo",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "inspection" => Ok(RecordType::Inspection),
            "property" => Ok(RecordType::Property),
            "photo" => Ok(RecordType::Photo),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown record type: {}",
                other
            ))),
        }
    }
}

/// A record that exists both in the local store and on the backend.
///
/// The payload is opaque to the engine: it is only compared, diffed by
/// top-level key, and (for merges) has a few named fields overlaid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Identifier shared by the local and remote copies.
    pub id: String,
    /// Record kind.
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Domain fields.
    pub data: Map<String, Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SyncableRecord {
    /// Create a record stamped with the current time.
    ///
    /// # Errors
    /// - Returns error if `id` is empty
    pub fn new(
        id: impl Into<String>,
        record_type: RecordType,
        data: Map<String, Value>,
    ) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Record id cannot be empty".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id,
            record_type,
            data,
            created_at: now,
            updated_at: now,
        })
    }

    /// Look up a top-level payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Approximate wire size of this record in bytes.
    pub fn approximate_size(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}

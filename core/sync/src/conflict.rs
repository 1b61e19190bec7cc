//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use fieldsync_common::{Error, RecordType, Result, SyncableRecord};

/// Default clock-skew tolerance for conflict detection.
pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_secs(60);

/// Conflict resolution priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ConflictPriority {
    /// Keep the local copy, overwrite remote.
    Local,
    /// Keep the remote copy, overwrite local.
    Remote,
    /// Merge mutable fields onto the remote copy.
    #[default]
    Merge,
    /// Defer to a human.
    Manual,
}

impl ConflictPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPriority::Local => "local",
            ConflictPriority::Remote => "remote",
            ConflictPriority::Merge => "merge",
            ConflictPriority::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ConflictPriority::Local),
            "remote" => Ok(ConflictPriority::Remote),
            "merge" => Ok(ConflictPriority::Merge),
            "manual" => Ok(ConflictPriority::Manual),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict priority: {}",
                other
            ))),
        }
    }
}

/// Persisted priorities are read leniently: anything unrecognized falls back
/// to the authoritative server copy.
impl From<String> for ConflictPriority {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!("Unrecognized conflict priority {:?}, using remote", value);
            ConflictPriority::Remote
        })
    }
}

/// A local/remote pair that diverged within the tolerance window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Id of the conflicting record.
    pub id: String,
    /// Record kind.
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Full local copy.
    pub local: SyncableRecord,
    /// Full remote copy.
    pub remote: SyncableRecord,
    /// Top-level payload fields whose values differ.
    pub fields: Vec<String>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

/// Decides whether two copies of a record conflict.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: Duration,
}

impl ConflictDetector {
    /// Create a detector with the given clock-skew tolerance.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Check whether two copies diverged concurrently.
    ///
    /// A gap at or beyond the window means one side is stale, and identical
    /// payloads mean both sides converged; neither is a conflict.
    pub fn has_conflict(
        &self,
        local: Option<&SyncableRecord>,
        remote: Option<&SyncableRecord>,
    ) -> bool {
        let (Some(local), Some(remote)) = (local, remote) else {
            return false;
        };

        let gap_ms = local
            .updated_at
            .signed_duration_since(remote.updated_at)
            .num_milliseconds()
            .unsigned_abs();

        gap_ms < self.window.as_millis() as u64 && local.data != remote.data
    }

    /// Names of all top-level payload fields whose values differ, including
    /// fields present on only one side.
    pub fn conflict_fields(&self, local: &SyncableRecord, remote: &SyncableRecord) -> Vec<String> {
        let keys: BTreeSet<&String> = local.data.keys().chain(remote.data.keys()).collect();
        keys.into_iter()
            .filter(|key| local.data.get(*key) != remote.data.get(*key))
            .cloned()
            .collect()
    }

    /// Build a conflict record if the pair conflicts.
    pub fn detect(
        &self,
        local: &SyncableRecord,
        remote: &SyncableRecord,
    ) -> Option<SyncConflict> {
        if !self.has_conflict(Some(local), Some(remote)) {
            return None;
        }

        Some(SyncConflict {
            id: local.id.clone(),
            record_type: local.record_type,
            local: local.clone(),
            remote: remote.clone(),
            fields: self.conflict_fields(local, remote),
            detected_at: Utc::now(),
        })
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_WINDOW)
    }
}

/// Fields a merge may take from the newer local copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Scalar fields overlaid from local when local is newer.
    pub mutable_fields: Vec<String>,
    /// List-valued field unioned by identifier.
    pub attachments_field: String,
    /// Key identifying an attachment entry.
    pub attachment_id_key: String,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            mutable_fields: vec!["status".to_string(), "notes".to_string()],
            attachments_field: "attachments".to_string(),
            attachment_id_key: "id".to_string(),
        }
    }
}

/// Result of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Value both stores should converge on.
    Resolved(SyncableRecord),
    /// Awaiting manual resolution; nothing is written.
    Deferred,
}

/// Conflict resolver.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    merge: MergePolicy,
}

impl ConflictResolver {
    /// Create a resolver with the given merge policy.
    pub fn new(merge: MergePolicy) -> Self {
        Self { merge }
    }

    /// Resolve a conflict under the given priority.
    pub fn resolve(&self, conflict: &SyncConflict, priority: ConflictPriority) -> Resolution {
        self.resolve_at(conflict, priority, Utc::now())
    }

    /// Resolve a conflict, stamping merges with `now`.
    pub fn resolve_at(
        &self,
        conflict: &SyncConflict,
        priority: ConflictPriority,
        now: DateTime<Utc>,
    ) -> Resolution {
        match priority {
            ConflictPriority::Local => Resolution::Resolved(conflict.local.clone()),
            ConflictPriority::Remote => Resolution::Resolved(conflict.remote.clone()),
            ConflictPriority::Merge => Resolution::Resolved(self.merge(conflict, now)),
            ConflictPriority::Manual => Resolution::Deferred,
        }
    }

    /// Remote is always the base; local wins the mutable fields only when it
    /// is strictly newer. Attachments are unioned in both cases.
    fn merge(&self, conflict: &SyncConflict, now: DateTime<Utc>) -> SyncableRecord {
        let local = &conflict.local;
        let mut merged = conflict.remote.clone();
        let local_newer = local.updated_at > conflict.remote.updated_at;

        if local_newer {
            for field in &self.merge.mutable_fields {
                if let Some(value) = local.data.get(field) {
                    merged.data.insert(field.clone(), value.clone());
                }
            }
        }

        let field = &self.merge.attachments_field;
        if let Some(union) =
            self.union_attachments(conflict.remote.field(field), local.field(field), local_newer)
        {
            merged.data.insert(field.clone(), union);
        }

        merged.updated_at = now;
        merged
    }

    fn union_attachments(
        &self,
        base: Option<&Value>,
        overlay: Option<&Value>,
        overlay_wins: bool,
    ) -> Option<Value> {
        let base = base.and_then(Value::as_array);
        let overlay = overlay.and_then(Value::as_array);
        if base.is_none() && overlay.is_none() {
            return None;
        }

        let mut merged: Vec<Value> = base.cloned().unwrap_or_default();
        let mut index: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, item)| (self.attachment_key(item), i))
            .collect();

        for item in overlay.into_iter().flatten() {
            let key = self.attachment_key(item);
            match index.get(&key) {
                Some(&i) => {
                    if overlay_wins {
                        merged[i] = item.clone();
                    }
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push(item.clone());
                }
            }
        }

        Some(Value::Array(merged))
    }

    /// Entries without an id are identified by their whole value.
    fn attachment_key(&self, item: &Value) -> String {
        item.get(&self.merge.attachment_id_key)
            .unwrap_or(item)
            .to_string()
    }
}

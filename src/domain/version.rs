//! Entity version tracking
//!
//! Every accepted change to a canonical entity appends an immutable
//! `VersionRecord` holding the full snapshot, a structural diff against the
//! prior snapshot, and a SHA-256 checksum of the canonical byte encoding.
//! Version numbers are dense and monotonic per entity, starting at 1.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Entity family a version row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Supplier,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Supplier => "supplier",
        }
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(Self::Product),
            "supplier" => Ok(Self::Supplier),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Kind of change a version row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Restore,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "restore" => Ok(Self::Restore),
            other => Err(format!("unknown change kind: {other}")),
        }
    }
}

/// Direction of a single field change within a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChangeKind {
    Added,
    Removed,
    Modified,
}

/// One changed field between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub kind: FieldChangeKind,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Immutable historical record of an entity state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version_no: u32,
    pub change_kind: ChangeKind,
    pub author: String,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 over the canonical byte encoding of `snapshot`
    pub checksum: String,
    pub snapshot: Value,
    pub diff: Vec<FieldChange>,
}

impl VersionRecord {
    /// Verify the stored checksum against the snapshot bytes
    pub fn checksum_valid(&self) -> bool {
        checksum_hex(&canonical_bytes(&self.snapshot)) == self.checksum
    }
}

/// Canonical byte encoding of a JSON snapshot: object keys sorted
/// recursively, serialized without extra whitespace. Two semantically equal
/// snapshots always produce identical bytes.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), sort(v))).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    // serde_json preserves insertion order for Value::Object, so sorting
    // before serializing fixes the byte layout.
    serde_json::to_vec(&sort(value)).unwrap_or_default()
}

/// Hex SHA-256 digest of the given bytes
pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Structural diff between two snapshots: added, removed and modified
/// top-level keys with before/after values. Nested objects are compared as
/// whole values.
pub fn compute_diff(old: &Value, new: &Value) -> Vec<FieldChange> {
    let empty = serde_json::Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    let mut fields: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
    fields.sort();
    fields.dedup();

    let mut changes = Vec::new();
    for field in fields {
        let before = old_map.get(field);
        let after = new_map.get(field);
        match (before, after) {
            (None, Some(value)) => changes.push(FieldChange {
                field: field.clone(),
                kind: FieldChangeKind::Added,
                before: None,
                after: Some(value.clone()),
            }),
            (Some(value), None) => changes.push(FieldChange {
                field: field.clone(),
                kind: FieldChangeKind::Removed,
                before: Some(value.clone()),
                after: None,
            }),
            (Some(old_value), Some(new_value)) if old_value != new_value => changes.push(FieldChange {
                field: field.clone(),
                kind: FieldChangeKind::Modified,
                before: Some(old_value.clone()),
                after: Some(new_value.clone()),
            }),
            _ => {}
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_are_key_order_independent() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn diff_reports_added_removed_modified() {
        let old = json!({"title": "apple", "moq": 10, "gone": true});
        let new = json!({"title": "apples", "moq": 10, "fresh": 1});

        let diff = compute_diff(&old, &new);
        let by_field = |name: &str| diff.iter().find(|c| c.field == name).unwrap();

        assert_eq!(by_field("title").kind, FieldChangeKind::Modified);
        assert_eq!(by_field("gone").kind, FieldChangeKind::Removed);
        assert_eq!(by_field("fresh").kind, FieldChangeKind::Added);
        assert!(diff.iter().all(|c| c.field != "moq"));
    }

    #[test]
    fn checksum_validates_snapshot() {
        let snapshot = json!({"title": "widget"});
        let record = VersionRecord {
            entity_type: EntityType::Product,
            entity_id: "p-1".to_string(),
            version_no: 1,
            change_kind: ChangeKind::Create,
            author: "system".to_string(),
            created_at: Utc::now(),
            checksum: checksum_hex(&canonical_bytes(&snapshot)),
            snapshot,
            diff: Vec::new(),
        };
        assert!(record.checksum_valid());
    }
}

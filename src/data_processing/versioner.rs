//! Version tracking (C8)
//!
//! For each accepted record the versioner hashes the canonical byte
//! encoding; an unchanged checksum writes no new version. Otherwise it
//! appends a version row carrying the full snapshot and a structural diff
//! against the previous snapshot. CREATE, DELETE and RESTORE are explicit
//! change kinds even when the diff is trivial.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::domain::repositories::VersionRepository;
use crate::domain::version::{
    canonical_bytes, checksum_hex, compute_diff, ChangeKind, EntityType, VersionRecord,
};

/// Outcome of offering a snapshot to the versioner
#[derive(Debug, Clone, PartialEq)]
pub enum VersionOutcome {
    /// A new version row was appended
    Written(u32),
    /// Checksum matched the previous version; nothing written
    Unchanged,
}

/// The versioner (C8)
#[derive(Debug, Clone)]
pub struct Versioner {
    author: String,
}

impl Default for Versioner {
    fn default() -> Self {
        Self {
            author: "system".to_string(),
        }
    }
}

impl Versioner {
    pub fn new(author: impl Into<String>) -> Self {
        Self { author: author.into() }
    }

    /// Build the version row for a snapshot, or `None` when the checksum
    /// matches the previous version and the change kind is `Update`.
    pub fn build_record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        snapshot: Value,
        change_kind: ChangeKind,
        previous: Option<&VersionRecord>,
    ) -> Option<VersionRecord> {
        let checksum = checksum_hex(&canonical_bytes(&snapshot));

        if change_kind == ChangeKind::Update {
            if let Some(prev) = previous {
                if prev.checksum == checksum {
                    debug!("No version for {entity_id}: canonical bytes unchanged");
                    return None;
                }
            }
        }

        // A CREATE is always version 1 with no prior; an entity that
        // already has history records an UPDATE instead.
        let change_kind = match (change_kind, previous) {
            (ChangeKind::Create, Some(_)) => ChangeKind::Update,
            (kind, _) => kind,
        };

        let diff = previous
            .map(|prev| compute_diff(&prev.snapshot, &snapshot))
            .unwrap_or_default();

        Some(VersionRecord {
            entity_type,
            entity_id: entity_id.to_string(),
            version_no: previous.map_or(1, |prev| prev.version_no + 1),
            change_kind,
            author: self.author.clone(),
            created_at: Utc::now(),
            checksum,
            snapshot,
            diff,
        })
    }

    /// Record a snapshot against the repository. Reads the latest version,
    /// gates on the checksum and appends when changed.
    pub async fn record(
        &self,
        versions: &dyn VersionRepository,
        entity_type: EntityType,
        entity_id: &str,
        snapshot: Value,
        change_kind: ChangeKind,
    ) -> Result<VersionOutcome> {
        let previous = versions.latest(entity_type, entity_id).await?;
        match self.build_record(entity_type, entity_id, snapshot, change_kind, previous.as_ref()) {
            Some(record) => {
                let version_no = record.version_no;
                versions.append(&record).await?;
                Ok(VersionOutcome::Written(version_no))
            }
            None => Ok(VersionOutcome::Unchanged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::memory::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_noop_then_update() {
        let store = InMemoryStore::new();
        let versioner = Versioner::default();
        let snapshot = json!({"title": "红苹果", "price_min": 2.5});

        let outcome = versioner
            .record(&store, EntityType::Product, "p-1", snapshot.clone(), ChangeKind::Create)
            .await
            .unwrap();
        assert_eq!(outcome, VersionOutcome::Written(1));

        // Byte-identical snapshot writes nothing
        let outcome = versioner
            .record(&store, EntityType::Product, "p-1", snapshot.clone(), ChangeKind::Update)
            .await
            .unwrap();
        assert_eq!(outcome, VersionOutcome::Unchanged);

        let changed = json!({"title": "红苹果", "price_min": 2.8});
        let outcome = versioner
            .record(&store, EntityType::Product, "p-1", changed, ChangeKind::Update)
            .await
            .unwrap();
        assert_eq!(outcome, VersionOutcome::Written(2));

        let latest = store.latest(EntityType::Product, "p-1").await.unwrap().unwrap();
        assert_eq!(latest.version_no, 2);
        assert_eq!(latest.diff.len(), 1);
        assert_eq!(latest.diff[0].field, "price_min");
        assert!(latest.checksum_valid());
    }

    #[tokio::test]
    async fn delete_and_restore_always_write() {
        let store = InMemoryStore::new();
        let versioner = Versioner::default();
        let snapshot = json!({"title": "x", "deleted": false});

        versioner
            .record(&store, EntityType::Product, "p-1", snapshot.clone(), ChangeKind::Create)
            .await
            .unwrap();

        let deleted = json!({"title": "x", "deleted": true});
        let outcome = versioner
            .record(&store, EntityType::Product, "p-1", deleted.clone(), ChangeKind::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, VersionOutcome::Written(2));

        let outcome = versioner
            .record(&store, EntityType::Product, "p-1", snapshot, ChangeKind::Restore)
            .await
            .unwrap();
        assert_eq!(outcome, VersionOutcome::Written(3));

        let latest = store.latest(EntityType::Product, "p-1").await.unwrap().unwrap();
        assert_eq!(latest.change_kind, ChangeKind::Restore);
    }

    #[test]
    fn create_with_history_downgrades_to_update() {
        let versioner = Versioner::default();
        let prior = versioner
            .build_record(EntityType::Product, "p-1", json!({"a": 1}), ChangeKind::Create, None)
            .unwrap();
        let next = versioner
            .build_record(EntityType::Product, "p-1", json!({"a": 2}), ChangeKind::Create, Some(&prior))
            .unwrap();
        assert_eq!(next.change_kind, ChangeKind::Update);
        assert_eq!(next.version_no, 2);
    }
}

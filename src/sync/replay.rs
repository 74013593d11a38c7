//! Post-batch reconciliation: rebuild local rows from the server-confirmed
//! base plus whatever is still outstanding.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use super::messages::WrittenColumn;
use crate::journal::{EntityId, EntityType, OutstandingEntry, OutstandingJournal};
use crate::storage::{EntityStore, StorageError};

/// Apply `entries` (already in sequence order) on top of `base`.
pub fn fold_entries(base: &Map<String, Value>, entries: &[OutstandingEntry]) -> Map<String, Value> {
    let mut folded = base.clone();
    for entry in entries {
        folded.insert(entry.column.clone(), entry.value.clone());
    }
    folded
}

/// Journal entries that went out in a batch the server accepted, plus the
/// columns the reply itself wrote.
#[derive(Debug, Default, Clone)]
pub struct ConfirmedEntries {
    by_type: HashMap<EntityType, HashSet<u64>>,
    server_written: HashSet<WrittenColumn>,
}

impl ConfirmedEntries {
    pub fn insert(&mut self, entity_type: EntityType, sequence_ids: impl IntoIterator<Item = u64>) {
        self.by_type
            .entry(entity_type)
            .or_default()
            .extend(sequence_ids);
    }

    pub fn contains(&self, entity_type: EntityType, sequence_id: u64) -> bool {
        self.by_type
            .get(&entity_type)
            .map(|ids| ids.contains(&sequence_id))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.values().all(|ids| ids.is_empty())
    }

    pub fn mark_server_written(&mut self, written: impl IntoIterator<Item = WrittenColumn>) {
        self.server_written.extend(written);
    }

    /// Whether the server set this column in the same round trip. Its value
    /// then wins over any confirmed local entry for the column.
    pub fn is_server_written(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        column: &str,
    ) -> bool {
        self.server_written.contains(&WrittenColumn {
            entity_type,
            entity_id,
            column: column.to_string(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub entities: usize,
    pub confirmed: usize,
}

/// Rebuild every row of `entity_type` that still has outstanding entries.
///
/// Unless `after_errors` is set, entries listed in `confirmed` are folded
/// into the row's server base and removed from the journal first. With
/// `after_errors` nothing is considered accepted and every entry is
/// reapplied.
pub async fn replay_outstanding(
    journal: &dyn OutstandingJournal,
    store: &dyn EntityStore,
    entity_type: EntityType,
    after_errors: bool,
    confirmed: &ConfirmedEntries,
) -> Result<ReplayStats, StorageError> {
    reconcile(journal, store, entity_type, after_errors, confirmed, true).await
}

/// Drop confirmed entries of a type whose rows are not replayed.
pub async fn clear_confirmed(
    journal: &dyn OutstandingJournal,
    store: &dyn EntityStore,
    entity_type: EntityType,
    confirmed: &ConfirmedEntries,
) -> Result<ReplayStats, StorageError> {
    reconcile(journal, store, entity_type, false, confirmed, false).await
}

async fn reconcile(
    journal: &dyn OutstandingJournal,
    store: &dyn EntityStore,
    entity_type: EntityType,
    after_errors: bool,
    confirmed: &ConfirmedEntries,
    rewrite_rows: bool,
) -> Result<ReplayStats, StorageError> {
    let mut stats = ReplayStats::default();

    for entity_id in journal.query_distinct_entity_ids(entity_type).await? {
        let entries = journal
            .query_ordered_entries_for(entity_type, entity_id)
            .await?;

        let (accepted, remaining): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| !after_errors && confirmed.contains(entity_type, e.sequence_id));

        if accepted.is_empty() && !rewrite_rows {
            continue;
        }

        let Some(mut record) = store.fetch(entity_type, entity_id).await? else {
            // The row may not be written yet; its entries stay for the next pass.
            log::warn!(
                "Outstanding changes for missing {}#{}, leaving them journaled",
                entity_type,
                entity_id
            );
            continue;
        };

        let folded: Vec<OutstandingEntry> = accepted
            .iter()
            .filter(|e| !confirmed.is_server_written(entity_type, entity_id, &e.column))
            .cloned()
            .collect();
        if !folded.is_empty() {
            record.server_fields = fold_entries(&record.server_fields, &folded);
        }

        let mut changed = !accepted.is_empty();
        if rewrite_rows {
            let mut base = record.fields.clone();
            base.extend(record.server_fields.clone());
            let rebuilt = fold_entries(&base, &remaining);
            if rebuilt != record.fields {
                record.fields = rebuilt;
                changed = true;
            }
        }

        if changed {
            store.save(entity_type, &record).await?;
        }

        if !accepted.is_empty() {
            let ids: Vec<u64> = accepted.iter().map(|e| e.sequence_id).collect();
            stats.confirmed += journal.clear(entity_type, &ids).await?;
        }
        stats.entities += 1;
    }

    if stats.entities > 0 {
        log::debug!(
            "Replayed {} {} row(s), {} change(s) confirmed",
            stats.entities,
            entity_type,
            stats.confirmed
        );
    }
    Ok(stats)
}

use std::collections::HashSet;
use std::convert::TryInto;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{
    now_millis, ChangeEvent, EntityId, EntityType, OutstandingEntry, OutstandingJournal,
};
use crate::storage::StorageError;

/// On-disk form of an entry. The value is kept as JSON text because bincode
/// cannot decode self-describing `serde_json::Value`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRow {
    entity_id: EntityId,
    column: String,
    value_json: String,
    created_at: i64,
}

/// Outstanding journal backed by one Sled tree per entity type.
///
/// Keys are the big-endian sequence id, so iterating a tree yields entries
/// in the order they were recorded. The sequence counter lives in a separate
/// metadata tree and is shared by every entity type.
///
/// A second tree per type indexes entries by `(entity_id, sequence_id)` so
/// one entity's entries are a prefix scan. The row is written after its
/// index key and removed before it; index keys without a row are skipped.
pub struct SledJournal {
    db: sled::Db,
    meta: sled::Tree,
    events: broadcast::Sender<ChangeEvent>,
}

impl SledJournal {
    const META_TREE: &'static str = "__journal_meta__";
    const NEXT_ID_KEY: &'static [u8] = b"__next_id__";
    const EVENT_CAPACITY: usize = 1024;

    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let meta = db.open_tree(Self::META_TREE)?;
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Ok(Self {
            db: db.clone(),
            meta,
            events,
        })
    }

    fn tree(&self, entity_type: EntityType) -> Result<sled::Tree, StorageError> {
        Ok(self
            .db
            .open_tree(format!("outstanding:{}", entity_type.table()))?)
    }

    fn index(&self, entity_type: EntityType) -> Result<sled::Tree, StorageError> {
        Ok(self
            .db
            .open_tree(format!("outstanding_index:{}", entity_type.table()))?)
    }

    fn next_sequence_id(&self) -> Result<u64, StorageError> {
        let updated = self.meta.update_and_fetch(Self::NEXT_ID_KEY, |old| {
            let current = old.and_then(decode_id).unwrap_or(0);
            Some(current.wrapping_add(1).to_be_bytes().to_vec())
        })?;

        updated
            .as_deref()
            .and_then(decode_id)
            .ok_or_else(|| StorageError::EncodingError("corrupt journal sequence".to_string()))
    }

    fn decode_entry(
        entity_type: EntityType,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<OutstandingEntry>, StorageError> {
        let Some(sequence_id) = decode_id(key) else {
            return Ok(None);
        };
        let (row, _): (JournalRow, usize) =
            bincode::serde::decode_from_slice(value, bincode::config::standard())?;
        Ok(Some(OutstandingEntry {
            sequence_id,
            entity_type,
            entity_id: row.entity_id,
            column: row.column,
            value: serde_json::from_str(&row.value_json)?,
            created_at: row.created_at,
        }))
    }

    /// Every entry of one type in sequence order.
    pub fn all_entries(&self, entity_type: EntityType) -> Result<Vec<OutstandingEntry>, StorageError> {
        let mut entries = Vec::new();
        for item in self.tree(entity_type)?.iter() {
            let (key, value) = item?;
            if let Some(entry) = Self::decode_entry(entity_type, &key, &value)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

/// Big-endian with the sign bit flipped, so negative ids sort first.
fn entity_prefix(entity_id: EntityId) -> [u8; 8] {
    ((entity_id as u64) ^ (1 << 63)).to_be_bytes()
}

fn index_key(entity_id: EntityId, sequence_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&entity_prefix(entity_id));
    key[8..].copy_from_slice(&sequence_id.to_be_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

#[async_trait::async_trait]
impl OutstandingJournal for SledJournal {
    async fn append(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        column: &str,
        value: serde_json::Value,
    ) -> Result<OutstandingEntry, StorageError> {
        let sequence_id = self.next_sequence_id()?;
        let created_at = now_millis();

        let row = JournalRow {
            entity_id,
            column: column.to_string(),
            value_json: serde_json::to_string(&value)?,
            created_at,
        };
        let bytes = bincode::serde::encode_to_vec(&row, bincode::config::standard())?;

        let tree = self.tree(entity_type)?;
        self.index(entity_type)?
            .insert(index_key(entity_id, sequence_id), Vec::<u8>::new())?;
        tree.insert(sequence_id.to_be_bytes(), bytes)?;
        self.db.flush_async().await?;

        log::debug!(
            "Journaled {}#{} {} (seq={})",
            entity_type,
            entity_id,
            column,
            sequence_id
        );

        // Nobody listening is fine; the entry is durable either way.
        let _ = self.events.send(ChangeEvent {
            entity_type,
            entity_id,
        });

        Ok(OutstandingEntry {
            sequence_id,
            entity_type,
            entity_id,
            column: column.to_string(),
            value,
            created_at,
        })
    }

    async fn query_distinct_entity_ids(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<EntityId>, StorageError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for entry in self.all_entries(entity_type)? {
            if seen.insert(entry.entity_id) {
                ids.push(entry.entity_id);
            }
        }
        Ok(ids)
    }

    async fn query_ordered_entries_for(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
    ) -> Result<Vec<OutstandingEntry>, StorageError> {
        let tree = self.tree(entity_type)?;
        let mut entries = Vec::new();
        for item in self.index(entity_type)?.scan_prefix(entity_prefix(entity_id)) {
            let (key, _) = item?;
            let Some(sequence_id) = key.get(8..).and_then(decode_id) else {
                continue;
            };
            let seq_key = sequence_id.to_be_bytes();
            if let Some(value) = tree.get(seq_key)? {
                if let Some(entry) = Self::decode_entry(entity_type, &seq_key, &value)? {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn get(
        &self,
        entity_type: EntityType,
        sequence_id: u64,
    ) -> Result<Option<OutstandingEntry>, StorageError> {
        let key = sequence_id.to_be_bytes();
        match self.tree(entity_type)?.get(key)? {
            Some(value) => Self::decode_entry(entity_type, &key, &value),
            None => Ok(None),
        }
    }

    async fn clear(
        &self,
        entity_type: EntityType,
        sequence_ids: &[u64],
    ) -> Result<usize, StorageError> {
        let tree = self.tree(entity_type)?;
        let index = self.index(entity_type)?;
        let mut removed = 0;
        for id in sequence_ids {
            if let Some(value) = tree.remove(id.to_be_bytes())? {
                let (row, _): (JournalRow, usize) =
                    bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
                index.remove(index_key(row.entity_id, *id))?;
                removed += 1;
            }
        }
        self.db.flush_async().await?;
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

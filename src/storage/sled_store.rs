use std::convert::TryInto;

use serde_json::{Map, Value};

use super::{is_uuid_empty, EntityRecord, EntityStore, StorageError};
use crate::journal::{EntityId, EntityType};

const WATERMARK_TREE: &str = "__watermarks__";

/// Entity rows stored as JSON in per-type Sled trees, with a secondary
/// `remote:<table>` tree mapping server ids to local ids.
pub struct SledEntityStore {
    db: sled::Db,
}

impl SledEntityStore {
    pub fn new(db: &sled::Db) -> Self {
        Self { db: db.clone() }
    }

    fn entity_tree(&self, entity_type: EntityType) -> Result<sled::Tree, StorageError> {
        Ok(self
            .db
            .open_tree(format!("entities:{}", entity_type.table()))?)
    }

    fn remote_tree(&self, entity_type: EntityType) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(format!("remote:{}", entity_type.table()))?)
    }

    fn decode_record(bytes: &[u8]) -> Result<EntityRecord, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

#[async_trait::async_trait]
impl EntityStore for SledEntityStore {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<EntityRecord>, StorageError> {
        match self.entity_tree(entity_type)?.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn fetch_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<EntityRecord>, StorageError> {
        if is_uuid_empty(remote_id) {
            return Ok(None);
        }
        let Some(id_bytes) = self.remote_tree(entity_type)?.get(remote_id.as_bytes())? else {
            return Ok(None);
        };
        match decode_i64(&id_bytes) {
            Some(id) => self.fetch(entity_type, id).await,
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        fields: Map<String, Value>,
    ) -> Result<EntityRecord, StorageError> {
        let id = self.db.generate_id()? as i64 + 1;
        let record = EntityRecord {
            id,
            remote_id: remote_id.to_string(),
            fields: fields.clone(),
            server_fields: if is_uuid_empty(remote_id) {
                Map::new()
            } else {
                fields
            },
            pushed_at: 0,
        };
        self.save(entity_type, &record).await?;
        log::debug!("Created {}#{} (remote_id={})", entity_type, id, remote_id);
        Ok(record)
    }

    async fn save(
        &self,
        entity_type: EntityType,
        record: &EntityRecord,
    ) -> Result<(), StorageError> {
        let tree = self.entity_tree(entity_type)?;
        let remote = self.remote_tree(entity_type)?;

        let previous = tree
            .insert(record.id.to_be_bytes(), serde_json::to_vec(record)?)?
            .map(|bytes| Self::decode_record(&bytes))
            .transpose()?;

        if let Some(previous) = previous {
            if previous.remote_id != record.remote_id && !is_uuid_empty(&previous.remote_id) {
                remote.remove(previous.remote_id.as_bytes())?;
            }
        }
        if !is_uuid_empty(&record.remote_id) {
            remote.insert(record.remote_id.as_bytes(), record.id.to_be_bytes().to_vec())?;
        }

        tree.flush_async().await?;
        Ok(())
    }

    async fn watermark(&self, entity_type: EntityType) -> Result<i64, StorageError> {
        let tree = self.db.open_tree(WATERMARK_TREE)?;
        Ok(tree
            .get(entity_type.table().as_bytes())?
            .and_then(|bytes| decode_i64(&bytes))
            .unwrap_or(0))
    }

    async fn set_watermark(
        &self,
        entity_type: EntityType,
        pushed_at: i64,
    ) -> Result<(), StorageError> {
        let tree = self.db.open_tree(WATERMARK_TREE)?;
        tree.insert(entity_type.table().as_bytes(), pushed_at.to_be_bytes().to_vec())?;
        Ok(())
    }
}

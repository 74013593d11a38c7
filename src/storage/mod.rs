mod error;
mod sled_store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::journal::{EntityId, EntityType, OutstandingJournal};

pub use self::error::StorageError;
pub use self::sled_store::SledEntityStore;

/// Remote id of an entity the server has not created yet.
pub const NO_UUID: &str = "0";

pub fn is_uuid_empty(uuid: &str) -> bool {
    uuid.is_empty() || uuid == NO_UUID
}

/// A synced entity as the engine sees it.
///
/// `fields` is what the client shows; `server_fields` is the last state the
/// server confirmed. Replay rebuilds `fields` from `server_fields` plus the
/// outstanding journal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub remote_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub server_fields: Map<String, Value>,
    #[serde(default)]
    pub pushed_at: i64,
}

impl EntityRecord {
    pub fn has_remote_id(&self) -> bool {
        !is_uuid_empty(&self.remote_id)
    }
}

#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<EntityRecord>, StorageError>;

    async fn fetch_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<EntityRecord>, StorageError>;

    /// Insert a new entity with a freshly allocated local id.
    async fn create(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        fields: Map<String, Value>,
    ) -> Result<EntityRecord, StorageError>;

    async fn save(&self, entity_type: EntityType, record: &EntityRecord)
        -> Result<(), StorageError>;

    /// Last `pushed_at` the server reported for this type; 0 when never briefed.
    async fn watermark(&self, entity_type: EntityType) -> Result<i64, StorageError>;

    async fn set_watermark(&self, entity_type: EntityType, pushed_at: i64)
        -> Result<(), StorageError>;
}

/// Apply a local edit to the entity and journal it for sync.
///
/// Pass `id = None` to create the entity; the new record is returned either
/// way.
pub async fn apply_local_change(
    store: &dyn EntityStore,
    journal: &dyn OutstandingJournal,
    entity_type: EntityType,
    id: Option<EntityId>,
    column: &str,
    value: Value,
) -> Result<EntityRecord, StorageError> {
    let mut record = match id {
        Some(id) => store
            .fetch(entity_type, id)
            .await?
            .ok_or(StorageError::EntityNotFound {
                table: entity_type.table(),
                id,
            })?,
        None => store.create(entity_type, NO_UUID, Map::new()).await?,
    };

    record.fields.insert(column.to_string(), value.clone());
    store.save(entity_type, &record).await?;
    journal.append(entity_type, record.id, column, value).await?;

    Ok(record)
}

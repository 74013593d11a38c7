//! Durable journal of local field changes that the server has not confirmed yet.

mod sled_journal;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::storage::StorageError;

pub use sled_journal::SledJournal;

/// Local row identifier of a synced entity.
pub type EntityId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Tag,
    UserActivity,
    TaskAttachment,
    TaskListMetadata,
    User,
}

impl EntityType {
    /// Entity types whose local edits are journaled.
    pub const JOURNALED: [EntityType; 5] = [
        EntityType::Task,
        EntityType::Tag,
        EntityType::UserActivity,
        EntityType::TaskAttachment,
        EntityType::TaskListMetadata,
    ];

    /// Table name used on the wire and for storage trees.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Task => "tasks",
            EntityType::Tag => "tags",
            EntityType::UserActivity => "activity",
            EntityType::TaskAttachment => "attachments",
            EntityType::TaskListMetadata => "task_list_metadata",
            EntityType::User => "users",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "tasks" => Some(EntityType::Task),
            "tags" => Some(EntityType::Tag),
            "activity" => Some(EntityType::UserActivity),
            "attachments" => Some(EntityType::TaskAttachment),
            "task_list_metadata" => Some(EntityType::TaskListMetadata),
            "users" => Some(EntityType::User),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// One pending field mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingEntry {
    pub sequence_id: u64,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub column: String,
    pub value: serde_json::Value,
    /// Milliseconds since UNIX_EPOCH.
    pub created_at: i64,
}

/// Published by the journal after every append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

#[async_trait::async_trait]
pub trait OutstandingJournal: Send + Sync {
    /// Record a local change and notify subscribers.
    async fn append(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        column: &str,
        value: serde_json::Value,
    ) -> Result<OutstandingEntry, StorageError>;

    /// Ids of entities with outstanding changes, in order of their oldest entry.
    async fn query_distinct_entity_ids(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<EntityId>, StorageError>;

    /// Entries for one entity, ordered by sequence id.
    async fn query_ordered_entries_for(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
    ) -> Result<Vec<OutstandingEntry>, StorageError>;

    async fn get(
        &self,
        entity_type: EntityType,
        sequence_id: u64,
    ) -> Result<Option<OutstandingEntry>, StorageError>;

    /// Delete confirmed entries. Returns how many were removed.
    async fn clear(&self, entity_type: EntityType, sequence_ids: &[u64])
        -> Result<usize, StorageError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

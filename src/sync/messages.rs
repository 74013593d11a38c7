//! Client-to-server commands and the server-to-client messages that come
//! back in a sync reply.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::SyncError;
use crate::journal::{EntityId, EntityType, OutstandingEntry, OutstandingJournal};
use crate::storage::{is_uuid_empty, EntityStore, StorageError, NO_UUID};

/// Column of a list-metadata row holding the ordered local task ids.
pub const TASK_IDS_COLUMN: &str = "task_ids";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChangesHappened,
    BriefMe,
    TaskListMetadataChangesHappened,
}

/// Structural identity of a client message; the queue never holds two
/// messages with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub kind: MessageKind,
    pub entity_type: EntityType,
    pub entity_id: Option<EntityId>,
}

impl MessageKey {
    pub fn changes(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            kind: MessageKind::ChangesHappened,
            entity_type,
            entity_id: Some(entity_id),
        }
    }
}

/// All outstanding changes of one entity, coalesced into a single command.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesHappened {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub remote_id: String,
    pub entries: Vec<OutstandingEntry>,
}

impl ChangesHappened {
    pub async fn load(
        journal: &dyn OutstandingJournal,
        store: &dyn EntityStore,
        entity_type: EntityType,
        entity_id: EntityId,
    ) -> Result<Self, StorageError> {
        let mut message = Self {
            entity_type,
            entity_id,
            remote_id: NO_UUID.to_string(),
            entries: Vec::new(),
        };
        message.refresh(journal, store).await?;
        Ok(message)
    }

    /// Re-read the entity's entries and remote id; both may have moved on
    /// while the message sat in the queue.
    pub async fn refresh(
        &mut self,
        journal: &dyn OutstandingJournal,
        store: &dyn EntityStore,
    ) -> Result<(), StorageError> {
        self.entries = journal
            .query_ordered_entries_for(self.entity_type, self.entity_id)
            .await?;
        if let Some(record) = store.fetch(self.entity_type, self.entity_id).await? {
            self.remote_id = record.remote_id;
        }
        Ok(())
    }

    pub fn sequence_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.sequence_id).collect()
    }

    fn to_json(&self, kind: &str, values: &[Value]) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let changes: Vec<Value> = self
            .entries
            .iter()
            .zip(values)
            .map(|(entry, value)| {
                json!({
                    "id": entry.sequence_id,
                    "column": entry.column,
                    "value": value,
                    "created_at": entry.created_at,
                })
            })
            .collect();

        let uuid = if is_uuid_empty(&self.remote_id) {
            NO_UUID
        } else {
            self.remote_id.as_str()
        };
        Some(json!({
            "type": kind,
            "table": self.entity_type.table(),
            "uuid": uuid,
            "local_id": self.entity_id,
            "changes": changes,
        }))
    }

    fn serialize_to_json(&self) -> Option<Value> {
        let values: Vec<Value> = self.entries.iter().map(|e| e.value.clone()).collect();
        self.to_json("ChangesHappened", &values)
    }
}

/// Asks the server for everything of one type pushed after the watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct BriefMe {
    pub entity_type: EntityType,
    pub pushed_at: i64,
}

impl BriefMe {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            pushed_at: 0,
        }
    }
}

/// List ordering changes. Positions refer to tasks, so local task ids are
/// translated to server ids at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskListMetadataChangesHappened {
    pub changes: ChangesHappened,
    remote_values: Vec<Value>,
}

impl TaskListMetadataChangesHappened {
    pub async fn load(
        journal: &dyn OutstandingJournal,
        store: &dyn EntityStore,
        entity_id: EntityId,
    ) -> Result<Self, StorageError> {
        let changes =
            ChangesHappened::load(journal, store, EntityType::TaskListMetadata, entity_id).await?;
        let remote_values = changes.entries.iter().map(|e| e.value.clone()).collect();
        Ok(Self {
            changes,
            remote_values,
        })
    }

    /// Local ids of every task the ordering refers to.
    pub fn prerequisite_task_ids(&self) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for entry in &self.changes.entries {
            if entry.column != TASK_IDS_COLUMN {
                continue;
            }
            for id in entry.value.as_array().into_iter().flatten() {
                if let Some(id) = id.as_i64() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids
    }

    async fn refresh(
        &mut self,
        journal: &dyn OutstandingJournal,
        store: &dyn EntityStore,
    ) -> Result<(), StorageError> {
        self.changes.refresh(journal, store).await?;

        let mut remote_values = Vec::with_capacity(self.changes.entries.len());
        for entry in &self.changes.entries {
            if entry.column != TASK_IDS_COLUMN {
                remote_values.push(entry.value.clone());
                continue;
            }
            let mut uuids = Vec::new();
            for id in entry.value.as_array().into_iter().flatten() {
                let uuid = match id.as_i64() {
                    Some(id) => store
                        .fetch(EntityType::Task, id)
                        .await?
                        .map(|task| task.remote_id)
                        .unwrap_or_else(|| NO_UUID.to_string()),
                    None => NO_UUID.to_string(),
                };
                uuids.push(Value::String(uuid));
            }
            remote_values.push(Value::Array(uuids));
        }
        self.remote_values = remote_values;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientToServerMessage {
    ChangesHappened(ChangesHappened),
    BriefMe(BriefMe),
    TaskListMetadataChangesHappened(TaskListMetadataChangesHappened),
}

impl ClientToServerMessage {
    pub fn key(&self) -> MessageKey {
        match self {
            ClientToServerMessage::ChangesHappened(m) => MessageKey::changes(m.entity_type, m.entity_id),
            ClientToServerMessage::BriefMe(m) => MessageKey {
                kind: MessageKind::BriefMe,
                entity_type: m.entity_type,
                entity_id: None,
            },
            ClientToServerMessage::TaskListMetadataChangesHappened(m) => MessageKey {
                kind: MessageKind::TaskListMetadataChangesHappened,
                entity_type: EntityType::TaskListMetadata,
                entity_id: Some(m.changes.entity_id),
            },
        }
    }

    /// Bring the message up to date right before it is serialized.
    pub async fn prepare(
        &mut self,
        journal: &dyn OutstandingJournal,
        store: &dyn EntityStore,
    ) -> Result<(), StorageError> {
        match self {
            ClientToServerMessage::ChangesHappened(m) => m.refresh(journal, store).await,
            ClientToServerMessage::BriefMe(m) => {
                m.pushed_at = store.watermark(m.entity_type).await?;
                Ok(())
            }
            ClientToServerMessage::TaskListMetadataChangesHappened(m) => {
                m.refresh(journal, store).await
            }
        }
    }

    /// `None` when there is nothing to send for this message.
    pub fn serialize_to_json(&self) -> Option<Value> {
        match self {
            ClientToServerMessage::ChangesHappened(m) => m.serialize_to_json(),
            ClientToServerMessage::BriefMe(m) => Some(json!({
                "type": "BriefMe",
                "table": m.entity_type.table(),
                "pushed_at": m.pushed_at,
            })),
            ClientToServerMessage::TaskListMetadataChangesHappened(m) => {
                m.changes.to_json("TaskListMetadataChangesHappened", &m.remote_values)
            }
        }
    }

    /// Journal entries carried by this message.
    pub fn sent_entries(&self) -> Option<(EntityType, Vec<u64>)> {
        match self {
            ClientToServerMessage::ChangesHappened(m) => Some((m.entity_type, m.sequence_ids())),
            ClientToServerMessage::TaskListMetadataChangesHappened(m) => {
                Some((EntityType::TaskListMetadata, m.changes.sequence_ids()))
            }
            ClientToServerMessage::BriefMe(_) => None,
        }
    }
}

/// Remote values for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeChanges {
    pub table: String,
    pub uuid: String,
    #[serde(default)]
    pub local_id: Option<EntityId>,
    #[serde(default)]
    pub changes: Map<String, Value>,
    #[serde(default)]
    pub pushed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowBriefed {
    pub table: String,
    pub pushed_at: i64,
}

/// The server has incorporated these journal entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgeChange {
    pub table: String,
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugMessage {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerToClientMessage {
    #[serde(rename = "changes")]
    MakeChanges(MakeChanges),
    #[serde(rename = "now_briefed")]
    NowBriefed(NowBriefed),
    #[serde(rename = "ack")]
    AcknowledgeChange(AcknowledgeChange),
    #[serde(rename = "debug")]
    Debug(DebugMessage),
}

/// A column a server message wrote on a local row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WrittenColumn {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub column: String,
}

fn entity_type_for(table: &str) -> Result<EntityType, SyncError> {
    EntityType::from_table(table).ok_or_else(|| SyncError::Decode(format!("unknown table '{table}'")))
}

impl ServerToClientMessage {
    pub fn decode(value: &Value) -> Result<Self, SyncError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerToClientMessage::MakeChanges(_) => "MakeChanges",
            ServerToClientMessage::NowBriefed(_) => "NowBriefed",
            ServerToClientMessage::AcknowledgeChange(_) => "AcknowledgeChange",
            ServerToClientMessage::Debug(_) => "Debug",
        }
    }

    /// Apply the message to local storage. Returns the columns it set
    /// from server values, so replay does not fold local entries over them.
    pub async fn process(
        &self,
        journal: &dyn OutstandingJournal,
        store: &dyn EntityStore,
    ) -> Result<Vec<WrittenColumn>, SyncError> {
        match self {
            ServerToClientMessage::MakeChanges(m) => make_changes(m, store).await,
            ServerToClientMessage::NowBriefed(m) => {
                let entity_type = entity_type_for(&m.table)?;
                advance_watermark(store, entity_type, m.pushed_at).await?;
                Ok(Vec::new())
            }
            ServerToClientMessage::AcknowledgeChange(m) => {
                acknowledge(m, journal, store).await?;
                Ok(Vec::new())
            }
            ServerToClientMessage::Debug(m) => {
                log::info!("Sync server says: {}", m.message);
                Ok(Vec::new())
            }
        }
    }
}

async fn advance_watermark(
    store: &dyn EntityStore,
    entity_type: EntityType,
    pushed_at: i64,
) -> Result<(), SyncError> {
    if pushed_at > store.watermark(entity_type).await? {
        store.set_watermark(entity_type, pushed_at).await?;
    }
    Ok(())
}

async fn make_changes(
    m: &MakeChanges,
    store: &dyn EntityStore,
) -> Result<Vec<WrittenColumn>, SyncError> {
    let entity_type = entity_type_for(&m.table)?;
    if is_uuid_empty(&m.uuid) {
        return Err(SyncError::Decode(format!("{} change without uuid", m.table)));
    }

    let existing = match store.fetch_by_remote_id(entity_type, &m.uuid).await? {
        Some(record) => Some(record),
        None => match m.local_id {
            Some(local_id) => store.fetch(entity_type, local_id).await?,
            None => None,
        },
    };

    let entity_id = match existing {
        Some(mut record) => {
            record.remote_id = m.uuid.clone();
            for (column, value) in &m.changes {
                record.server_fields.insert(column.clone(), value.clone());
                record.fields.insert(column.clone(), value.clone());
            }
            if let Some(pushed_at) = m.pushed_at {
                record.pushed_at = record.pushed_at.max(pushed_at);
            }
            store.save(entity_type, &record).await?;
            record.id
        }
        None => {
            let mut record = store.create(entity_type, &m.uuid, m.changes.clone()).await?;
            if let Some(pushed_at) = m.pushed_at {
                record.pushed_at = pushed_at;
                store.save(entity_type, &record).await?;
            }
            record.id
        }
    };

    if let Some(pushed_at) = m.pushed_at {
        advance_watermark(store, entity_type, pushed_at).await?;
    }
    Ok(m.changes
        .keys()
        .map(|column| WrittenColumn {
            entity_type,
            entity_id,
            column: column.clone(),
        })
        .collect())
}

async fn acknowledge(
    m: &AcknowledgeChange,
    journal: &dyn OutstandingJournal,
    store: &dyn EntityStore,
) -> Result<(), SyncError> {
    let entity_type = entity_type_for(&m.table)?;
    for id in &m.ids {
        let Some(entry) = journal.get(entity_type, *id).await? else {
            continue;
        };
        if let Some(mut record) = store.fetch(entity_type, entry.entity_id).await? {
            record.server_fields.insert(entry.column.clone(), entry.value.clone());
            store.save(entity_type, &record).await?;
        }
    }
    let cleared = journal.clear(entity_type, &m.ids).await?;
    log::debug!("Server acknowledged {} {} change(s)", cleared, entity_type);
    Ok(())
}

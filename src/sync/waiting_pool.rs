use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::sleep;

use super::messages::{ClientToServerMessage, MessageKey, TaskListMetadataChangesHappened};
use super::queue::{Callback, PendingQueue};
use crate::config::WaitingPoolConfig;
use crate::journal::{EntityId, EntityType};
use crate::storage::{EntityStore, StorageError};

/// Recently sent message identities, bounded so a long session does not
/// grow it forever.
pub struct SentKeys {
    inner: Mutex<(VecDeque<MessageKey>, HashSet<MessageKey>)>,
    capacity: usize,
}

impl SentKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((VecDeque::new(), HashSet::new())),
            capacity,
        }
    }

    pub fn record(&self, key: MessageKey) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (order, set) = &mut *guard;
        if !set.insert(key) {
            return;
        }
        order.push_back(key);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.1.contains(key)
    }
}

impl Default for SentKeys {
    fn default() -> Self {
        Self::new(4096)
    }
}

struct HeldMessage {
    message: TaskListMetadataChangesHappened,
    since: Instant,
    /// Bumped whenever the content is replaced.
    version: u64,
}

/// Holds list-ordering changes until every task they position has reached
/// the server (or is on its way there).
pub struct WaitingPool {
    held: Mutex<Vec<HeldMessage>>,
    versions: AtomicU64,
    settle: Duration,
    max_hold: Duration,
}

impl WaitingPool {
    pub fn new(config: &WaitingPoolConfig) -> Self {
        Self {
            held: Mutex::new(Vec::new()),
            versions: AtomicU64::new(0),
            settle: Duration::from_millis(config.settle_ms),
            max_hold: Duration::from_secs(config.max_hold_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HeldMessage>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Hold a message. A message with the same identity is replaced by the
    /// newer content but keeps its original hold time. Returns whether it
    /// was new.
    pub fn enqueue_message(&self, message: TaskListMetadataChangesHappened) -> bool {
        let key = ClientToServerMessage::TaskListMetadataChangesHappened(message.clone()).key();
        let version = self.versions.fetch_add(1, Ordering::Relaxed);
        let mut held = self.lock();
        for existing in held.iter_mut() {
            if existing.message.changes.entity_id == message.changes.entity_id {
                existing.message = message;
                existing.version = version;
                return false;
            }
        }
        log::debug!("Holding {:?} until its tasks are known to the server", key);
        held.push(HeldMessage {
            message,
            since: Instant::now(),
            version,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Move every held message whose prerequisites are met into `queue`.
    /// Returns how many were promoted.
    pub async fn promote_ready(
        &self,
        store: &dyn EntityStore,
        queue: &PendingQueue,
        sent: &SentKeys,
        refresh: &Callback,
    ) -> Result<usize, StorageError> {
        let candidates: Vec<(TaskListMetadataChangesHappened, u64, Duration)> = self
            .lock()
            .iter()
            .map(|h| (h.message.clone(), h.version, h.since.elapsed()))
            .filter(|(_, _, age)| *age >= self.settle)
            .collect();

        let mut ready = Vec::new();
        for (message, version, age) in candidates {
            if age >= self.max_hold {
                log::warn!(
                    "List metadata #{} held for {:?}, sending without its prerequisites",
                    message.changes.entity_id,
                    age
                );
                ready.push((message.changes.entity_id, version));
            } else if prerequisites_met(&message, store, queue, sent).await? {
                ready.push((message.changes.entity_id, version));
            }
        }

        let promoted = self.take_checked(&ready);

        let count = promoted.len();
        for message in promoted {
            queue.enqueue(
                ClientToServerMessage::TaskListMetadataChangesHappened(message),
                Some(refresh.clone()),
            );
        }
        Ok(count)
    }

    /// Remove and return the held messages listed in `ready`. A message
    /// replaced since its check stays held for the next pass.
    fn take_checked(&self, ready: &[(EntityId, u64)]) -> Vec<TaskListMetadataChangesHappened> {
        let mut held = self.lock();
        let mut promoted = Vec::new();
        held.retain(|h| {
            if ready.contains(&(h.message.changes.entity_id, h.version)) {
                promoted.push(h.message.clone());
                false
            } else {
                true
            }
        });
        promoted
    }

    /// Re-check held messages every settle period until shutdown.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn EntityStore>,
        queue: Arc<PendingQueue>,
        sent: Arc<SentKeys>,
        refresh: Callback,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.settle.max(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = sleep(period) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if self.is_empty() {
                continue;
            }
            match self.promote_ready(store.as_ref(), &queue, &sent, &refresh).await {
                Ok(0) => {}
                Ok(n) => log::debug!("Promoted {} list metadata change(s) to the sync queue", n),
                Err(e) => log::error!("Waiting pool failed to check prerequisites: {e}"),
            }
        }
    }
}

async fn prerequisites_met(
    message: &TaskListMetadataChangesHappened,
    store: &dyn EntityStore,
    queue: &PendingQueue,
    sent: &SentKeys,
) -> Result<bool, StorageError> {
    for task_id in message.prerequisite_task_ids() {
        let key = MessageKey::changes(EntityType::Task, task_id);
        if queue.contains(&key) || sent.contains(&key) {
            continue;
        }
        match store.fetch(EntityType::Task, task_id).await? {
            Some(task) if task.has_remote_id() => continue,
            _ => return Ok(false),
        }
    }
    Ok(true)
}

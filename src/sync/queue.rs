use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use super::messages::{ClientToServerMessage, MessageKey};

/// Completion hook run after the batch carrying its message is done.
///
/// Identity is the allocation: clones of one `Callback` are the same
/// callback, which is how the shared refresh hook is recognised.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self) -> anyhow::Result<()> {
        (self.0)()
    }

    pub fn is_same(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0))
    }
}

/// A drained message together with its completion hook.
#[derive(Debug)]
pub struct PendingMessage {
    pub message: ClientToServerMessage,
    pub callback: Option<Callback>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<ClientToServerMessage>,
    keys: HashSet<MessageKey>,
    callbacks: HashMap<MessageKey, Callback>,
}

/// FIFO of unsent client messages with structural de-duplication.
///
/// Producers are any task; the sync worker is the only consumer. Every
/// successful insert signals `wake`, which keeps a permit when the worker
/// is not parked yet, so a wake-up is never lost.
#[derive(Default)]
pub struct PendingQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned queue is still structurally valid; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append unless an equal message is already queued. A given callback
    /// replaces any earlier one for the same identity. Returns whether the
    /// message was inserted.
    pub fn enqueue(&self, message: ClientToServerMessage, callback: Option<Callback>) -> bool {
        let key = message.key();
        let inserted = {
            let mut state = self.lock();
            if let Some(callback) = callback {
                state.callbacks.insert(key, callback);
            }
            if state.keys.insert(key) {
                state.messages.push_back(message);
                true
            } else {
                false
            }
        };

        if inserted {
            self.wake.notify_one();
        }
        inserted
    }

    /// Remove up to `limit` messages from the head, each with its callback.
    pub fn drain(&self, limit: usize) -> Vec<PendingMessage> {
        let mut state = self.lock();
        let count = limit.min(state.messages.len());
        let mut drained = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(message) = state.messages.pop_front() else {
                break;
            };
            let key = message.key();
            state.keys.remove(&key);
            let callback = state.callbacks.remove(&key);
            drained.push(PendingMessage { message, callback });
        }
        drained
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.lock().keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Keys in queue order.
    pub fn keys(&self) -> Vec<MessageKey> {
        self.lock().messages.iter().map(|m| m.key()).collect()
    }

    /// Wake the worker without enqueuing anything.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::EntityType;
    use crate::sync::messages::{BriefMe, ChangesHappened};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn changes(id: i64) -> ClientToServerMessage {
        ClientToServerMessage::ChangesHappened(ChangesHappened {
            entity_type: EntityType::Task,
            entity_id: id,
            remote_id: "0".to_string(),
            entries: Vec::new(),
        })
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        Callback::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn duplicate_identity_is_not_queued_twice() {
        let queue = PendingQueue::new();
        assert!(queue.enqueue(changes(1), None));
        assert!(!queue.enqueue(changes(1), None));
        assert!(queue.enqueue(changes(2), None));
        assert!(queue.enqueue(
            ClientToServerMessage::BriefMe(BriefMe::new(EntityType::Task)),
            None
        ));
        assert_eq!(queue.len(), 3);

        let drained = queue.drain(10);
        assert_eq!(drained.len(), 3);
        assert!(queue.is_empty());

        // Once drained the identity may be queued again.
        assert!(queue.enqueue(changes(1), None));
    }

    #[test]
    fn drain_is_fifo_and_bounded() {
        let queue = PendingQueue::new();
        for id in 1..=5 {
            queue.enqueue(changes(id), None);
        }

        let first = queue.drain(2);
        let ids: Vec<_> = first.iter().map(|p| p.message.key().entity_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(queue.keys().len(), 3);
        assert_eq!(queue.drain(0).len(), 0);
    }

    #[test]
    fn later_callback_replaces_earlier_one() {
        let queue = PendingQueue::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        queue.enqueue(changes(1), Some(counting(&first)));
        queue.enqueue(changes(1), Some(counting(&second)));

        let drained = queue.drain(1);
        drained[0].callback.as_ref().unwrap().call().unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_identity_survives_clone() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = counting(&counter);
        let b = a.clone();
        let c = counting(&counter);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }

    #[tokio::test]
    async fn enqueue_before_wait_is_not_lost() {
        let queue = PendingQueue::new();
        queue.enqueue(changes(1), None);
        tokio::time::timeout(std::time::Duration::from_secs(1), queue.notified())
            .await
            .expect("stored wake-up");
    }

    #[test]
    fn concurrent_producers_never_duplicate() {
        let queue = Arc::new(PendingQueue::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for id in 0..50 {
                        queue.enqueue(changes(id), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain(usize::MAX);
        assert_eq!(drained.len(), 50);
        let unique: HashSet<_> = drained.iter().map(|p| p.message.key()).collect();
        assert_eq!(unique.len(), 50);
    }
}

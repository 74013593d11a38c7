use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use super::messages::{
    ChangesHappened, ClientToServerMessage, MessageKey, TaskListMetadataChangesHappened,
};
use super::queue::{Callback, PendingQueue};
use super::status::{LoopState, SharedSyncStatus, SyncStatusState};
use super::waiting_pool::{SentKeys, WaitingPool};
use super::worker::{panic_message, SyncWorker};
use super::SyncError;
use crate::config::SyncConfig;
use crate::journal::{ChangeEvent, EntityType, OutstandingJournal};
use crate::network::NetworkInvoker;
use crate::session::{AuthProvider, FeatureGate, RefreshNotifier};
use crate::storage::{EntityStore, StorageError};

/// Journaled types that travel as plain `ChangesHappened`.
const RESCANNED: [EntityType; 4] = [
    EntityType::Task,
    EntityType::Tag,
    EntityType::UserActivity,
    EntityType::TaskAttachment,
];

/// Everything the engine talks to.
pub struct SyncDeps {
    pub journal: Arc<dyn OutstandingJournal>,
    pub store: Arc<dyn EntityStore>,
    pub invoker: Arc<dyn NetworkInvoker>,
    pub auth: Arc<dyn AuthProvider>,
    pub gate: Arc<dyn FeatureGate>,
    pub notifier: Arc<dyn RefreshNotifier>,
}

/// State shared by the worker, the supervisor and the helper tasks.
pub(crate) struct SyncContext {
    pub(crate) journal: Arc<dyn OutstandingJournal>,
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) invoker: Arc<dyn NetworkInvoker>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) gate: Arc<dyn FeatureGate>,
    pub(crate) queue: Arc<PendingQueue>,
    pub(crate) pool: Arc<WaitingPool>,
    pub(crate) sent: Arc<SentKeys>,
    pub(crate) status: SharedSyncStatus,
    pub(crate) tick_due: AtomicBool,
    pub(crate) refresh: Callback,
    pub(crate) config: SyncConfig,
}

impl SyncContext {
    /// Rebuild queue content from the journal. Structural dedup makes this
    /// safe to call at any time.
    pub(crate) async fn repopulate(&self) -> Result<usize, StorageError> {
        let journal = self.journal.as_ref();
        let store = self.store.as_ref();
        let mut inserted = 0;

        for entity_type in RESCANNED {
            for entity_id in journal.query_distinct_entity_ids(entity_type).await? {
                let message = ChangesHappened::load(journal, store, entity_type, entity_id).await?;
                if self
                    .queue
                    .enqueue(ClientToServerMessage::ChangesHappened(message), None)
                {
                    inserted += 1;
                }
            }
        }

        for entity_id in journal
            .query_distinct_entity_ids(EntityType::TaskListMetadata)
            .await?
        {
            let message = TaskListMetadataChangesHappened::load(journal, store, entity_id).await?;
            self.pool.enqueue_message(message);
        }

        if inserted > 0 {
            log::info!("Queued {} entity change set(s) from the journal", inserted);
        }
        Ok(inserted)
    }

    async fn on_change(&self, event: ChangeEvent) -> Result<(), StorageError> {
        let journal = self.journal.as_ref();
        let store = self.store.as_ref();
        match event.entity_type {
            EntityType::TaskListMetadata => {
                let message =
                    TaskListMetadataChangesHappened::load(journal, store, event.entity_id).await?;
                self.pool.enqueue_message(message);
            }
            EntityType::User => {}
            entity_type => {
                let message =
                    ChangesHappened::load(journal, store, entity_type, event.entity_id).await?;
                self.queue
                    .enqueue(ClientToServerMessage::ChangesHappened(message), None);
            }
        }
        Ok(())
    }
}

/// Owns the sync loop and its helper tasks.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(deps: SyncDeps, config: SyncConfig) -> Self {
        let notifier = Arc::clone(&deps.notifier);
        let refresh = Callback::new(move || {
            notifier.refresh();
            Ok(())
        });
        let status = Arc::new(Mutex::new(SyncStatusState {
            batch_size: config.initial_batch_size.max(1),
            ..SyncStatusState::default()
        }));
        let (shutdown_tx, _) = watch::channel(false);

        let ctx = SyncContext {
            journal: deps.journal,
            store: deps.store,
            invoker: deps.invoker,
            auth: deps.auth,
            gate: deps.gate,
            queue: Arc::new(PendingQueue::new()),
            pool: Arc::new(WaitingPool::new(&config.waiting_pool)),
            sent: Arc::new(SentKeys::default()),
            status,
            tick_due: AtomicBool::new(false),
            refresh,
            config,
        };

        Self {
            ctx: Arc::new(ctx),
            shutdown_tx,
            started: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Queue a message. Returns whether it was inserted rather than merged
    /// with an equal message already waiting.
    pub fn enqueue_message(&self, message: ClientToServerMessage, callback: Option<Callback>) -> bool {
        self.ctx.queue.enqueue(message, callback)
    }

    pub async fn repopulate_queue_from_journal(&self) -> Result<usize, SyncError> {
        Ok(self.ctx.repopulate().await?)
    }

    /// Mark (or clear) a pending background refresh and wake the worker.
    pub fn set_time_for_background_sync(&self, due: bool) {
        self.ctx.tick_due.store(due, Ordering::SeqCst);
        if due {
            self.ctx.queue.notify();
        }
    }

    /// Re-check the blocked condition, e.g. after login or a gate change.
    pub fn wake(&self) {
        self.ctx.queue.notify();
    }

    /// The hook every `BriefMe` is bound to; it fires the refresh notifier.
    pub fn refresh_callback(&self) -> Callback {
        self.ctx.refresh.clone()
    }

    pub async fn status(&self) -> SyncStatusState {
        self.ctx.status.lock().await.clone()
    }

    pub fn pending_keys(&self) -> Vec<MessageKey> {
        self.ctx.queue.keys()
    }

    pub fn held_messages(&self) -> usize {
        self.ctx.pool.len()
    }

    /// Run one waiting-pool check right away.
    pub async fn promote_waiting(&self) -> Result<usize, SyncError> {
        Ok(self
            .ctx
            .pool
            .promote_ready(
                self.ctx.store.as_ref(),
                &self.ctx.queue,
                &self.ctx.sent,
                &self.ctx.refresh,
            )
            .await?)
    }

    /// A worker bound to this engine, for driving iterations by hand.
    /// Do not combine with `start`: the queue must have one consumer.
    pub fn worker(&self) -> SyncWorker {
        SyncWorker::new(Arc::clone(&self.ctx), self.shutdown_tx.subscribe())
    }

    /// Spawn the supervised worker and its helper tasks. Calling it again
    /// is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = &self.ctx;
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());

        // Subscribe before the first rescan so no append falls in between.
        let changes = ctx.journal.subscribe();
        tasks.push(tokio::spawn(listen_for_changes(
            Arc::clone(ctx),
            changes,
            self.shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(Arc::clone(&ctx.pool).run(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.queue),
            Arc::clone(&ctx.sent),
            ctx.refresh.clone(),
            self.shutdown_tx.subscribe(),
        )));

        if let Some(period) = ctx.config.background_interval() {
            tasks.push(tokio::spawn(background_ticker(
                Arc::clone(ctx),
                period,
                self.shutdown_tx.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(supervise(
            Arc::clone(ctx),
            self.shutdown_tx.subscribe(),
        )));
        log::info!("Sync engine started");
    }

    /// Stop every task and wait for them. An in-flight round trip is
    /// allowed to finish.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.ctx.queue.notify();

        let handles = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            mem::take(&mut *tasks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Sync task ended abnormally: {e}");
            }
        }
        self.ctx.status.lock().await.state = LoopState::Stopped;
        log::info!("Sync engine stopped");
    }
}

async fn supervise(ctx: Arc<SyncContext>, shutdown: watch::Receiver<bool>) {
    if let Err(e) = ctx.repopulate().await {
        log::error!("Initial journal scan failed: {e}");
    }

    loop {
        let worker = SyncWorker::new(Arc::clone(&ctx), shutdown.clone());
        let failure = match tokio::spawn(worker.run()).await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                SyncError::WorkerPanic(panic_message(&*payload)).to_string()
            }
            Err(_) => break,
        };

        log::error!("Sync worker died: {failure}. Restarting");
        {
            let mut status = ctx.status.lock().await;
            status.restarts += 1;
            status.last_error = Some(failure);
            status.state = LoopState::Stopped;
            status.batch_size = ctx.config.initial_batch_size.max(1);
        }

        let mut shutdown_wait = shutdown.clone();
        tokio::select! {
            _ = sleep(ctx.config.restart_delay()) => {}
            _ = shutdown_wait.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = ctx.repopulate().await {
            log::error!("Journal scan after restart failed: {e}");
        }
    }
}

async fn listen_for_changes(
    ctx: Arc<SyncContext>,
    mut changes: broadcast::Receiver<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = changes.recv() => event,
            _ = shutdown.changed() => break,
        };
        match event {
            Ok(event) => {
                if let Err(e) = ctx.on_change(event).await {
                    log::error!(
                        "Failed to queue change for {}#{}: {e}",
                        event.entity_type,
                        event.entity_id
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Missed {} change notification(s), rescanning journal", skipped);
                if let Err(e) = ctx.repopulate().await {
                    log::error!("Journal rescan failed: {e}");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn background_ticker(
    ctx: Arc<SyncContext>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log::debug!("Background sync due");
                ctx.tick_due.store(true, Ordering::SeqCst);
                ctx.queue.notify();
            }
            _ = shutdown.changed() => break,
        }
    }
}

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;

use super::engine::SyncContext;
use super::messages::{
    BriefMe, ClientToServerMessage, MessageKey, ServerToClientMessage, WrittenColumn,
};
use super::queue::{Callback, PendingMessage};
use super::replay::{clear_confirmed, replay_outstanding, ConfirmedEntries};
use super::status::LoopState;
use super::SyncError;
use crate::journal::{now_millis, EntityType};

/// Types whose rows are rebuilt from the journal after every round trip.
const REPLAYED: [EntityType; 3] = [
    EntityType::Task,
    EntityType::Tag,
    EntityType::TaskListMetadata,
];

/// Journaled types that only need confirmed entries dropped.
const CLEARED_ONLY: [EntityType; 2] = [EntityType::UserActivity, EntityType::TaskAttachment];

/// Order in which a background tick asks the server for news.
const BRIEFED: [EntityType; 4] = [
    EntityType::TaskListMetadata,
    EntityType::Task,
    EntityType::Tag,
    EntityType::User,
];

/// What one pass through the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing was queued.
    Idle,
    /// A batch is ready but there is no session token; it is kept for later.
    AwaitingToken,
    /// Every message in the batch serialized to nothing.
    Discarded,
    Sent { messages: usize, after_errors: bool },
    /// The round trip failed; the batch is not retried.
    Failed { messages: usize },
}

/// Single consumer of the pending queue.
pub struct SyncWorker {
    ctx: Arc<SyncContext>,
    shutdown: watch::Receiver<bool>,
    batch_size: usize,
    /// Drained messages that could not be sent yet.
    carried: Vec<PendingMessage>,
    /// Callbacks of discarded batches; they run after the next round trip.
    deferred: Vec<Callback>,
}

impl SyncWorker {
    pub(crate) fn new(ctx: Arc<SyncContext>, shutdown: watch::Receiver<bool>) -> Self {
        let batch_size = ctx.config.initial_batch_size.max(1);
        Self {
            ctx,
            shutdown,
            batch_size,
            carried: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Loop until shutdown. Returns an error only for failures the
    /// iteration cannot absorb; the supervisor restarts the worker then.
    pub async fn run(mut self) -> Result<(), SyncError> {
        log::info!("Sync worker started (batch size {})", self.batch_size);
        let mut park = false;
        while self.wait_until_ready(park).await {
            park = self.run_iteration().await? == IterationOutcome::AwaitingToken;
        }
        self.set_state(LoopState::Stopped).await;
        log::info!("Sync worker stopped");
        Ok(())
    }

    fn has_work(&self) -> bool {
        !self.carried.is_empty()
            || !self.ctx.queue.is_empty()
            || self.ctx.tick_due.load(Ordering::SeqCst)
    }

    fn may_sync(&self) -> bool {
        self.ctx.auth.is_authenticated() && self.ctx.gate.is_enabled()
    }

    /// Park in `Blocked` until there is something to do and we are allowed
    /// to do it. With `park` set, waits for at least one wake-up first.
    /// Returns false on shutdown.
    async fn wait_until_ready(&mut self, mut park: bool) -> bool {
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            if !park && self.has_work() && self.may_sync() {
                return true;
            }
            park = false;
            self.set_state(LoopState::Blocked).await;

            tokio::select! {
                _ = self.ctx.queue.notified() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
            if *self.shutdown.borrow() {
                return false;
            }
            // Let a burst of local writes land in the same batch.
            sleep(self.ctx.config.burst_delay()).await;
        }
    }

    /// One pass from batching to callbacks.
    pub async fn run_iteration(&mut self) -> Result<IterationOutcome, SyncError> {
        self.set_state(LoopState::Batching).await;

        if self.ctx.tick_due.load(Ordering::SeqCst) {
            self.ctx.repopulate().await?;
            for entity_type in BRIEFED {
                self.ctx.queue.enqueue(
                    ClientToServerMessage::BriefMe(BriefMe::new(entity_type)),
                    Some(self.ctx.refresh.clone()),
                );
            }
            self.ctx.tick_due.store(false, Ordering::SeqCst);
        }

        let room = self.batch_size.saturating_sub(self.carried.len());
        let drained = self.ctx.queue.drain(room);
        self.carried.extend(drained);
        if self.carried.is_empty() {
            return Ok(IterationOutcome::Idle);
        }

        let token = match self.ctx.auth.current_token() {
            Some(token) if self.may_sync() => token,
            _ => {
                log::debug!(
                    "Holding {} message(s) until a session is available",
                    self.carried.len()
                );
                self.set_state(LoopState::Blocked).await;
                return Ok(IterationOutcome::AwaitingToken);
            }
        };

        self.set_state(LoopState::Sending).await;
        let mut batch = mem::take(&mut self.carried);
        let mut payload = Vec::with_capacity(batch.len());
        let mut sent_entries = Vec::new();
        let mut sent_keys: Vec<MessageKey> = Vec::new();
        for pending in batch.iter_mut() {
            pending
                .message
                .prepare(self.ctx.journal.as_ref(), self.ctx.store.as_ref())
                .await?;
            if let Some(json) = pending.message.serialize_to_json() {
                payload.push(json);
                sent_keys.push(pending.message.key());
                sent_entries.extend(pending.message.sent_entries());
            }
        }

        if payload.is_empty() {
            log::debug!(
                "Batch of {} message(s) had nothing to send, dropping it",
                batch.len()
            );
            self.deferred
                .extend(batch.into_iter().filter_map(|pending| pending.callback));
            self.set_state(LoopState::Blocked).await;
            return Ok(IterationOutcome::Discarded);
        }

        let messages = payload.len();
        let after_errors;
        let mut failure = None;
        let mut written = Vec::new();
        match self
            .ctx
            .invoker
            .post_sync(&Value::Array(payload), &token)
            .await
        {
            Ok(reply) => {
                self.batch_size = self.batch_size.min(batch.len()) * 2;
                for key in sent_keys {
                    self.ctx.sent.record(key);
                }
                self.set_state(LoopState::ProcessingResponse).await;
                after_errors = self.process_reply(&reply, &mut written).await;
            }
            Err(e) if e.is_transport() => {
                self.batch_size = (self.batch_size / 2).max(1);
                log::warn!(
                    "Sync round trip failed: {e}. Dropping {} message(s), batch size now {}",
                    messages,
                    self.batch_size
                );
                after_errors = true;
                failure = Some(e.to_string());
            }
            Err(e) => {
                log::error!("Sync server refused batch of {}: {e}", messages);
                after_errors = true;
                failure = Some(e.to_string());
            }
        }

        self.set_state(LoopState::Replaying).await;
        self.replay(after_errors, sent_entries, written).await?;

        self.set_state(LoopState::Callbacks).await;
        self.run_callbacks(batch);

        {
            let mut status = self.ctx.status.lock().await;
            status.last_sync_ts_ms = now_millis();
            status.last_batch_sent = messages as u64;
            status.batch_size = self.batch_size;
            status.pending_messages = self.ctx.queue.len() as u64;
            if failure.is_none() {
                status.round_trips += 1;
            }
            // A clean round trip leaves the supervisor's last error alone.
            if failure.is_some() {
                status.last_error = failure.clone();
            }
        }

        if failure.is_some() {
            Ok(IterationOutcome::Failed { messages })
        } else {
            log::info!(
                "Synced {} message(s) (errors={}, next batch size {})",
                messages,
                after_errors,
                self.batch_size
            );
            Ok(IterationOutcome::Sent {
                messages,
                after_errors,
            })
        }
    }

    /// Apply the server's messages, collecting the columns they wrote.
    /// Returns whether the reply reported errors.
    async fn process_reply(&self, reply: &Value, written: &mut Vec<WrittenColumn>) -> bool {
        let messages = reply
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for raw in messages {
            let message = match ServerToClientMessage::decode(raw) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Skipping server message: {e}");
                    continue;
                }
            };
            match message
                .process(self.ctx.journal.as_ref(), self.ctx.store.as_ref())
                .await
            {
                Ok(columns) => written.extend(columns),
                Err(e) => log::warn!("Failed to apply {}: {e}", message.name()),
            }
        }

        match reply.get("errors").and_then(Value::as_array) {
            Some(errors) if !errors.is_empty() => {
                for error in errors {
                    log::warn!("Sync server reported: {error}");
                }
                true
            }
            _ => false,
        }
    }

    async fn replay(
        &self,
        after_errors: bool,
        sent_entries: Vec<(EntityType, Vec<u64>)>,
        written: Vec<WrittenColumn>,
    ) -> Result<(), SyncError> {
        let journal = self.ctx.journal.as_ref();
        let store = self.ctx.store.as_ref();

        let mut confirmed = ConfirmedEntries::default();
        if !after_errors {
            for (entity_type, ids) in sent_entries {
                confirmed.insert(entity_type, ids);
            }
        }
        confirmed.mark_server_written(written);

        for entity_type in REPLAYED {
            replay_outstanding(journal, store, entity_type, after_errors, &confirmed).await?;
        }
        if !confirmed.is_empty() {
            for entity_type in CLEARED_ONLY {
                clear_confirmed(journal, store, entity_type, &confirmed).await?;
            }
        }
        Ok(())
    }

    /// Run every message's callback in batch order, deferred ones first.
    /// The shared refresh hook fires at most once per iteration.
    fn run_callbacks(&mut self, batch: Vec<PendingMessage>) {
        let callbacks = mem::take(&mut self.deferred)
            .into_iter()
            .chain(batch.into_iter().filter_map(|pending| pending.callback));
        run_in_order(callbacks, &self.ctx.refresh);
    }

    async fn set_state(&self, state: LoopState) {
        let mut status = self.ctx.status.lock().await;
        status.state = state;
        status.batch_size = self.batch_size;
        status.pending_messages = self.ctx.queue.len() as u64;
    }
}

fn run_in_order(callbacks: impl IntoIterator<Item = Callback>, refresh: &Callback) {
    let mut refreshed = false;
    for callback in callbacks {
        if callback.is_same(refresh) {
            if refreshed {
                continue;
            }
            refreshed = true;
        }
        invoke(&callback);
    }
}

fn invoke(callback: &Callback) {
    let error = match panic::catch_unwind(AssertUnwindSafe(|| callback.call())) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => SyncError::Callback(format!("{e:#}")),
        Err(payload) => SyncError::Callback(format!("panicked: {}", panic_message(&*payload))),
    };
    log::error!("{error}");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

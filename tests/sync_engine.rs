use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tasksync::config::{SyncConfig, WaitingPoolConfig};
use tasksync::journal::{EntityType, OutstandingJournal, SledJournal};
use tasksync::network::{NetworkError, NetworkInvoker};
use tasksync::session::{RefreshNotifier, SessionAuth, SyncGate};
use tasksync::storage::{apply_local_change, EntityStore, SledEntityStore, NO_UUID};
use tasksync::sync::messages::{BriefMe, ChangesHappened, TASK_IDS_COLUMN};
use tasksync::sync::{
    Callback, ClientToServerMessage, IterationOutcome, LoopState, SyncDeps, SyncEngine,
};
use tempfile::TempDir;
use tokio::time::sleep;
use tonic::Status;

enum Step {
    Reply(Value),
    Unavailable,
    Panic,
}

/// Invoker that records every batch and answers from a script. An empty
/// script answers with an empty reply.
#[derive(Default)]
struct ScriptedInvoker {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(Value, String)>>,
}

impl ScriptedInvoker {
    fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    fn calls(&self) -> Vec<(Value, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl NetworkInvoker for ScriptedInvoker {
    async fn post_sync(&self, payload: &Value, token: &str) -> Result<Value, NetworkError> {
        self.calls
            .lock()
            .unwrap()
            .push((payload.clone(), token.to_string()));
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(json!({ "messages": [] })),
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Unavailable) => Err(Status::unavailable("offline").into()),
            Some(Step::Panic) => panic!("invoker exploded"),
        }
    }
}

#[derive(Default)]
struct CountingNotifier {
    refreshes: AtomicUsize,
}

impl RefreshNotifier for CountingNotifier {
    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    _tmp: TempDir,
    journal: Arc<SledJournal>,
    store: Arc<SledEntityStore>,
    invoker: Arc<ScriptedInvoker>,
    auth: Arc<SessionAuth>,
    gate: Arc<SyncGate>,
    notifier: Arc<CountingNotifier>,
    engine: SyncEngine,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let db = sled::open(tmp.path()).expect("open sled");
        let journal = Arc::new(SledJournal::new(&db).expect("journal"));
        let store = Arc::new(SledEntityStore::new(&db));
        let invoker = Arc::new(ScriptedInvoker::default());
        let auth = Arc::new(SessionAuth::new(Some("secret".to_string())));
        let gate = Arc::new(SyncGate::new(true));
        let notifier = Arc::new(CountingNotifier::default());

        let engine = SyncEngine::new(
            SyncDeps {
                journal: journal.clone(),
                store: store.clone(),
                invoker: invoker.clone(),
                auth: auth.clone(),
                gate: gate.clone(),
                notifier: notifier.clone(),
            },
            config,
        );

        Self {
            _tmp: tmp,
            journal,
            store,
            invoker,
            auth,
            gate,
            notifier,
            engine,
        }
    }

    fn refreshes(&self) -> usize {
        self.notifier.refreshes.load(Ordering::SeqCst)
    }

    async fn outstanding(&self, entity_type: EntityType) -> Vec<i64> {
        self.journal
            .query_distinct_entity_ids(entity_type)
            .await
            .unwrap()
    }
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        burst_delay_ms: 0,
        background_sync_secs: None,
        restart_delay_ms: 10,
        waiting_pool: WaitingPoolConfig {
            settle_ms: 0,
            max_hold_secs: 60,
        },
        ..SyncConfig::default()
    }
}

fn counting(counter: &Arc<AtomicUsize>) -> Callback {
    let counter = Arc::clone(counter);
    Callback::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[tokio::test]
async fn startup_batches_one_change_set_and_clears_it_after_success() {
    let h = Harness::new(fast_config());
    let task = apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        None,
        "title",
        json!("Buy milk"),
    )
    .await
    .unwrap();
    apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        Some(task.id),
        "completed",
        json!(false),
    )
    .await
    .unwrap();

    assert_eq!(h.engine.repopulate_queue_from_journal().await.unwrap(), 1);
    // A second scan finds the same message already queued.
    assert_eq!(h.engine.repopulate_queue_from_journal().await.unwrap(), 0);

    let mut worker = h.engine.worker();
    let outcome = worker.run_iteration().await.unwrap();
    assert_eq!(
        outcome,
        IterationOutcome::Sent {
            messages: 1,
            after_errors: false
        }
    );

    let calls = h.invoker.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "secret");
    let batch = calls[0].0.as_array().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["type"], "ChangesHappened");
    assert_eq!(batch[0]["changes"].as_array().unwrap().len(), 2);

    assert!(h.outstanding(EntityType::Task).await.is_empty());
    let record = h.store.fetch(EntityType::Task, task.id).await.unwrap().unwrap();
    assert_eq!(record.server_fields["title"], json!("Buy milk"));
    assert_eq!(record.fields["completed"], json!(false));

    // min(4, 1) * 2
    assert_eq!(worker.batch_size(), 2);
}

#[tokio::test]
async fn transport_failure_halves_batch_and_does_not_requeue() {
    let h = Harness::new(fast_config());
    let mut ids = Vec::new();
    for n in 0..4 {
        let task = apply_local_change(
            h.store.as_ref(),
            h.journal.as_ref(),
            EntityType::Task,
            None,
            "title",
            json!(format!("task {n}")),
        )
        .await
        .unwrap();
        ids.push(task.id);
    }
    h.engine.repopulate_queue_from_journal().await.unwrap();
    h.invoker.push(Step::Unavailable);

    let mut worker = h.engine.worker();
    let outcome = worker.run_iteration().await.unwrap();
    assert_eq!(outcome, IterationOutcome::Failed { messages: 4 });
    assert_eq!(worker.batch_size(), 2);
    assert!(h.engine.pending_keys().is_empty());

    // Nothing was confirmed, and replay kept the local view.
    assert_eq!(h.outstanding(EntityType::Task).await, ids);
    let record = h.store.fetch(EntityType::Task, ids[0]).await.unwrap().unwrap();
    assert_eq!(record.fields["title"], json!("task 0"));
    assert!(record.server_fields.is_empty());

    let status = h.engine.status().await;
    assert!(status.last_error.is_some());
    assert_eq!(status.round_trips, 0);

    assert_eq!(worker.run_iteration().await.unwrap(), IterationOutcome::Idle);
}

#[tokio::test]
async fn full_batch_success_doubles_batch_size() {
    let h = Harness::new(fast_config());
    for entity_type in [EntityType::Task, EntityType::Tag, EntityType::User, EntityType::TaskListMetadata] {
        h.engine.enqueue_message(
            ClientToServerMessage::BriefMe(BriefMe::new(entity_type)),
            None,
        );
    }

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();
    assert_eq!(worker.batch_size(), 8);
    assert_eq!(h.engine.status().await.batch_size, 8);
}

#[tokio::test]
async fn background_tick_briefs_every_table_and_refreshes_once() {
    let h = Harness::new(fast_config());
    h.engine.set_time_for_background_sync(true);

    let mut worker = h.engine.worker();
    let outcome = worker.run_iteration().await.unwrap();
    assert_eq!(
        outcome,
        IterationOutcome::Sent {
            messages: 4,
            after_errors: false
        }
    );

    let calls = h.invoker.calls();
    let tables: Vec<&str> = calls[0]
        .0
        .as_array()
        .unwrap()
        .iter()
        .map(|m| {
            assert_eq!(m["type"], "BriefMe");
            m["table"].as_str().unwrap()
        })
        .collect();
    assert_eq!(tables, vec!["task_list_metadata", "tasks", "tags", "users"]);

    // Four messages share one refresh hook; it fires once.
    assert_eq!(h.refreshes(), 1);
    assert_eq!(worker.run_iteration().await.unwrap(), IterationOutcome::Idle);
}

#[tokio::test]
async fn brief_reply_advances_watermark_for_next_brief() {
    let h = Harness::new(fast_config());
    h.invoker.push(Step::Reply(json!({
        "messages": [
            { "type": "changes", "table": "tags", "uuid": "t-1",
              "changes": { "name": "work" }, "pushed_at": 40 },
            { "type": "now_briefed", "table": "tags", "pushed_at": 50 },
            { "type": "teleport" },
        ]
    })));
    h.engine
        .enqueue_message(ClientToServerMessage::BriefMe(BriefMe::new(EntityType::Tag)), None);

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();

    let tag = h
        .store
        .fetch_by_remote_id(EntityType::Tag, "t-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag.fields["name"], json!("work"));
    assert_eq!(h.store.watermark(EntityType::Tag).await.unwrap(), 50);

    h.engine
        .enqueue_message(ClientToServerMessage::BriefMe(BriefMe::new(EntityType::Tag)), None);
    worker.run_iteration().await.unwrap();
    assert_eq!(h.invoker.calls()[1].0[0]["pushed_at"], 50);
}

#[tokio::test]
async fn server_errors_keep_entries_outstanding() {
    let h = Harness::new(fast_config());
    let task = apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        None,
        "title",
        json!("draft"),
    )
    .await
    .unwrap();
    h.engine.repopulate_queue_from_journal().await.unwrap();
    h.invoker.push(Step::Reply(json!({
        "messages": [],
        "errors": ["validation failed"],
    })));

    let mut worker = h.engine.worker();
    let outcome = worker.run_iteration().await.unwrap();
    assert_eq!(
        outcome,
        IterationOutcome::Sent {
            messages: 1,
            after_errors: true
        }
    );
    assert_eq!(h.outstanding(EntityType::Task).await, vec![task.id]);
}

#[tokio::test]
async fn server_assigned_uuid_is_bound_to_local_task() {
    let h = Harness::new(fast_config());
    let task = apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        None,
        "title",
        json!("call mom"),
    )
    .await
    .unwrap();
    h.engine.repopulate_queue_from_journal().await.unwrap();
    h.invoker.push(Step::Reply(json!({
        "messages": [{
            "type": "changes", "table": "tasks", "uuid": "srv-9",
            "local_id": task.id, "changes": { "title": "call mom" },
        }]
    })));

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();

    let calls = h.invoker.calls();
    assert_eq!(calls[0].0[0]["uuid"], NO_UUID);
    let record = h.store.fetch(EntityType::Task, task.id).await.unwrap().unwrap();
    assert_eq!(record.remote_id, "srv-9");
}

#[tokio::test]
async fn server_normalized_value_survives_replay() {
    let h = Harness::new(fast_config());
    let task = apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        None,
        "title",
        json!("mine"),
    )
    .await
    .unwrap();
    h.engine.repopulate_queue_from_journal().await.unwrap();
    h.invoker.push(Step::Reply(json!({
        "messages": [{
            "type": "changes", "table": "tasks", "uuid": "srv-3",
            "local_id": task.id, "changes": { "title": "Mine (normalized)" },
            "pushed_at": 10,
        }]
    })));

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();

    let record = h.store.fetch(EntityType::Task, task.id).await.unwrap().unwrap();
    assert_eq!(record.fields["title"], json!("Mine (normalized)"));
    assert_eq!(record.server_fields["title"], json!("Mine (normalized)"));
    assert!(h.outstanding(EntityType::Task).await.is_empty());
    assert_eq!(h.store.watermark(EntityType::Task).await.unwrap(), 10);
}

#[tokio::test]
async fn shared_callback_runs_for_every_message() {
    let h = Harness::new(fast_config());
    let called = Arc::new(AtomicUsize::new(0));
    let counter = counting(&called);

    let brief = |ty| ClientToServerMessage::BriefMe(BriefMe::new(ty));
    h.engine
        .enqueue_message(brief(EntityType::Task), Some(counter.clone()));
    h.engine
        .enqueue_message(brief(EntityType::Tag), Some(counter));

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();

    assert_eq!(called.load(Ordering::SeqCst), 2);
    assert_eq!(h.refreshes(), 0);
}

#[tokio::test]
async fn empty_payload_defers_callbacks_to_next_send() {
    let h = Harness::new(fast_config());
    let called = Arc::new(AtomicUsize::new(0));
    h.engine.enqueue_message(
        ClientToServerMessage::ChangesHappened(ChangesHappened {
            entity_type: EntityType::Tag,
            entity_id: 12,
            remote_id: NO_UUID.to_string(),
            entries: Vec::new(),
        }),
        Some(counting(&called)),
    );

    let mut worker = h.engine.worker();
    assert_eq!(
        worker.run_iteration().await.unwrap(),
        IterationOutcome::Discarded
    );
    assert!(h.invoker.calls().is_empty());
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(worker.batch_size(), 4);

    h.engine
        .enqueue_message(ClientToServerMessage::BriefMe(BriefMe::new(EntityType::Task)), None);
    assert!(matches!(
        worker.run_iteration().await.unwrap(),
        IterationOutcome::Sent { .. }
    ));
    assert_eq!(h.invoker.calls().len(), 1);
    assert_eq!(called.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_callback_does_not_stop_the_others() {
    let h = Harness::new(fast_config());
    let refresh = h.engine.refresh_callback();
    let called = Arc::new(AtomicUsize::new(0));
    let counter = counting(&called);

    let brief = |ty| ClientToServerMessage::BriefMe(BriefMe::new(ty));
    h.engine
        .enqueue_message(brief(EntityType::Task), Some(refresh.clone()));
    h.engine
        .enqueue_message(brief(EntityType::User), Some(Callback::new(|| panic!("bad hook"))));
    h.engine
        .enqueue_message(brief(EntityType::Tag), Some(refresh));
    h.engine
        .enqueue_message(brief(EntityType::TaskListMetadata), Some(counter));

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();

    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert_eq!(h.refreshes(), 1);
}

#[tokio::test]
async fn missing_session_holds_batch_without_network_call() {
    let h = Harness::new(fast_config());
    h.auth.log_out();
    h.engine
        .enqueue_message(ClientToServerMessage::BriefMe(BriefMe::new(EntityType::Task)), None);

    let mut worker = h.engine.worker();
    assert_eq!(
        worker.run_iteration().await.unwrap(),
        IterationOutcome::AwaitingToken
    );
    assert!(h.invoker.calls().is_empty());

    h.auth.log_in("fresh");
    let outcome = worker.run_iteration().await.unwrap();
    assert_eq!(
        outcome,
        IterationOutcome::Sent {
            messages: 1,
            after_errors: false
        }
    );
    assert_eq!(h.invoker.calls()[0].1, "fresh");
}

#[tokio::test]
async fn started_engine_stays_offline_until_login() {
    let h = Harness::new(fast_config());
    h.auth.log_out();
    h.engine.start();

    apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Tag,
        None,
        "name",
        json!("errands"),
    )
    .await
    .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(h.invoker.calls().is_empty());
    assert_eq!(h.engine.status().await.state, LoopState::Blocked);

    h.auth.log_in("secret");
    h.engine.wake();
    for _ in 0..200 {
        if h.outstanding(EntityType::Tag).await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.invoker.calls().len(), 1);
    assert!(h.outstanding(EntityType::Tag).await.is_empty());

    h.engine.shutdown().await;
    assert_eq!(h.engine.status().await.state, LoopState::Stopped);
}

#[tokio::test]
async fn started_engine_waits_for_feature_gate() {
    let h = Harness::new(fast_config());
    h.gate.set_enabled(false);
    h.engine.start();

    apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        None,
        "title",
        json!("gated"),
    )
    .await
    .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(h.invoker.calls().is_empty());
    assert!(!h.engine.pending_keys().is_empty());
    assert_eq!(h.engine.status().await.state, LoopState::Blocked);

    h.gate.set_enabled(true);
    h.engine.wake();
    for _ in 0..200 {
        if h.outstanding(EntityType::Task).await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.invoker.calls().len(), 1);
    assert!(h.outstanding(EntityType::Task).await.is_empty());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn supervisor_restarts_worker_after_panic() {
    let h = Harness::new(fast_config());
    apply_local_change(
        h.store.as_ref(),
        h.journal.as_ref(),
        EntityType::Task,
        None,
        "title",
        json!("survive"),
    )
    .await
    .unwrap();
    h.invoker.push(Step::Panic);

    h.engine.start();
    // Starting twice must not spawn a second consumer.
    h.engine.start();

    for _ in 0..300 {
        if h.outstanding(EntityType::Task).await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let status = h.engine.status().await;
    assert_eq!(status.restarts, 1);
    assert!(status.last_error.unwrap().contains("invoker exploded"));
    // The lost batch came back from the journal and went out again.
    assert_eq!(h.invoker.calls().len(), 2);
    assert!(h.outstanding(EntityType::Task).await.is_empty());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn list_order_waits_for_its_tasks() {
    let h = Harness::new(fast_config());
    let task = h
        .store
        .create(EntityType::Task, NO_UUID, Map::new())
        .await
        .unwrap();
    let list = h
        .store
        .create(EntityType::TaskListMetadata, NO_UUID, Map::new())
        .await
        .unwrap();
    h.journal
        .append(EntityType::TaskListMetadata, list.id, TASK_IDS_COLUMN, json!([task.id]))
        .await
        .unwrap();

    h.engine.repopulate_queue_from_journal().await.unwrap();
    assert_eq!(h.engine.held_messages(), 1);
    assert_eq!(h.engine.promote_waiting().await.unwrap(), 0);

    h.journal
        .append(EntityType::Task, task.id, "title", json!("first"))
        .await
        .unwrap();
    h.engine.repopulate_queue_from_journal().await.unwrap();
    assert_eq!(h.engine.promote_waiting().await.unwrap(), 1);
    assert_eq!(h.engine.pending_keys().len(), 2);

    let mut worker = h.engine.worker();
    worker.run_iteration().await.unwrap();
    let batch = h.invoker.calls()[0].0.clone();
    assert_eq!(batch[0]["type"], "ChangesHappened");
    assert_eq!(batch[1]["type"], "TaskListMetadataChangesHappened");
    assert!(h.outstanding(EntityType::TaskListMetadata).await.is_empty());
    // The promoted ordering carries the refresh hook.
    assert_eq!(h.refreshes(), 1);
}

use std::sync::Arc;
use tokio::sync::Mutex;

/// Where the sync worker currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Stopped,
    Blocked,
    Batching,
    Sending,
    ProcessingResponse,
    Replaying,
    Callbacks,
}

/// In-memory view of the sync worker, readable from any task.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusState {
    pub state: LoopState,
    /// Batch size the next iteration will use.
    pub batch_size: usize,
    /// Messages waiting in the pending queue after the last drain.
    pub pending_messages: u64,
    /// Number of messages sent in the last round trip.
    pub last_batch_sent: u64,
    /// Timestamp of the last round trip, in milliseconds since UNIX_EPOCH.
    pub last_sync_ts_ms: i64,
    /// Total successful round trips since start.
    pub round_trips: u64,
    /// How many times the supervisor had to restart the worker.
    pub restarts: u64,
    /// Last error seen by the worker or the supervisor, if any.
    pub last_error: Option<String>,
}

pub type SharedSyncStatus = Arc<Mutex<SyncStatusState>>;

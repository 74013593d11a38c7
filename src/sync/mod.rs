//! The sync engine: pending queue, background worker, replay and the
//! waiting pool for list ordering changes.

mod engine;
mod error;
pub mod messages;
pub mod queue;
pub mod replay;
pub mod status;
pub mod waiting_pool;
mod worker;

pub use engine::{SyncDeps, SyncEngine};
pub use error::SyncError;
pub use messages::{ClientToServerMessage, MessageKey, ServerToClientMessage};
pub use queue::{Callback, PendingQueue};
pub use status::{LoopState, SharedSyncStatus, SyncStatusState};
pub use worker::{IterationOutcome, SyncWorker};

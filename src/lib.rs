pub mod config;
pub mod journal;
pub mod logging;
pub mod network;
pub mod session;
pub mod storage;
pub mod sync;

// Public exports
pub use config::SyncConfig;
pub use journal::{EntityType, OutstandingJournal, SledJournal};
pub use storage::{EntityStore, SledEntityStore};
pub use sync::{SyncDeps, SyncEngine};

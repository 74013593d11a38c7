use thiserror::Error;

use crate::network::NetworkError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Cannot decode server message: {0}")]
    Decode(String),

    #[error("Sync callback failed: {0}")]
    Callback(String),

    #[error("Sync worker panicked: {0}")]
    WorkerPanic(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

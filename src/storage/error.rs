use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Entity not found: {table} #{id}")]
    EntityNotFound { table: &'static str, id: i64 },

    #[error("Unknown table: {0}")]
    UnknownTable(String),
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StorageError::EncodingError(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StorageError::EncodingError(err.to_string())
    }
}

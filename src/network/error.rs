use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("RPC error: {0}")]
    RpcError(#[from] Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Malformed response: {0}")]
    DecodeError(String),
}

impl NetworkError {
    /// True for failures where the batch may never have reached the server.
    pub fn is_transport(&self) -> bool {
        match self {
            NetworkError::TransportError(_) | NetworkError::ConnectionError(_) => true,
            NetworkError::RpcError(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled
            ),
            NetworkError::DecodeError(_) => false,
        }
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        NetworkError::DecodeError(err.to_string())
    }
}

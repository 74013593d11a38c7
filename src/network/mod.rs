mod error;

pub mod client;

pub use client::GrpcInvoker;
pub use error::NetworkError;

pub mod proto {
    tonic::include_proto!("tasksync");
}

/// Sends one batch to the sync server and returns its reply.
///
/// The request is a JSON array of client messages; the reply is an object
/// with a `messages` array and an optional `errors` array. Timeouts surface
/// as transport errors.
#[async_trait::async_trait]
pub trait NetworkInvoker: Send + Sync {
    async fn post_sync(
        &self,
        payload: &serde_json::Value,
        token: &str,
    ) -> Result<serde_json::Value, NetworkError>;
}

use std::time::Duration;

use tokio::sync::Mutex;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use super::proto::sync_service_client::SyncServiceClient;
use super::proto::SyncBatch;
use super::{NetworkError, NetworkInvoker};

/// `NetworkInvoker` talking to the sync server over gRPC.
///
/// The channel is opened lazily on the first batch and dropped after a
/// transport failure so the next batch reconnects.
pub struct GrpcInvoker {
    address: String,
    timeout: Duration,
    client: Mutex<Option<SyncServiceClient<Channel>>>,
}

impl GrpcInvoker {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            timeout: Duration::from_secs(30),
            client: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint_uri(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }

    async fn connect(&self) -> Result<SyncServiceClient<Channel>, NetworkError> {
        let endpoint = Endpoint::from_shared(self.endpoint_uri())
            .map_err(|e| NetworkError::ConnectionError(e.to_string()))?;

        let channel = endpoint
            .connect_timeout(Duration::from_secs(5))
            .timeout(self.timeout)
            .connect()
            .await?;

        log::info!("Connected to sync server at {}", self.address);
        Ok(SyncServiceClient::new(channel))
    }
}

#[async_trait::async_trait]
impl NetworkInvoker for GrpcInvoker {
    async fn post_sync(
        &self,
        payload: &serde_json::Value,
        token: &str,
    ) -> Result<serde_json::Value, NetworkError> {
        let mut guard = self.client.lock().await;
        let mut client = match guard.as_ref() {
            Some(client) => client.clone(),
            None => {
                let client = self.connect().await?;
                *guard = Some(client.clone());
                client
            }
        };
        drop(guard);

        let mut request = Request::new(SyncBatch {
            token: token.to_string(),
            payload: payload.to_string(),
        });
        if let Ok(value) = MetadataValue::try_from(format!("Bearer {token}")) {
            request.metadata_mut().insert("authorization", value);
        }

        match client.post_sync(request).await {
            Ok(response) => Ok(serde_json::from_str(&response.into_inner().payload)?),
            Err(status) => {
                let err = NetworkError::from(status);
                if err.is_transport() {
                    self.client.lock().await.take();
                }
                Err(err)
            }
        }
    }
}

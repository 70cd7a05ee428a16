//! AgentSync gRPC client — agent side.
//!
//! Every call carries the agent's region and shard as metadata. Unary
//! calls are bounded by a per-request timeout; streams are not, since a
//! watch is expected to stay open indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::Request;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::control_plane::{AgentIdentity, ControlPlane, EventStream};
use crate::error::{SyncError, SyncResult};
use crate::event::{InfraEvent, ResourceKind, StatusUpdate};
use crate::proto::agent_sync_client::AgentSyncClient;
use crate::proto::{Envelope, REGION_HEADER, SHARD_HEADER, WatchRequest, WorkloadLookup};

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// [`ControlPlane`] reached over gRPC.
#[derive(Clone)]
pub struct GrpcControlPlane {
    client: AgentSyncClient<Channel>,
    config: ClientConfig,
}

impl GrpcControlPlane {
    /// Build a client for `address`. The connection is established lazily
    /// on first use and re-established by the channel after failures.
    pub fn connect_lazy(address: &str, config: ClientConfig) -> SyncResult<Self> {
        let endpoint = Endpoint::from_shared(address.to_string())
            .map_err(|e| SyncError::InvalidArgument(format!("control plane address: {e}")))?
            .connect_timeout(config.connect_timeout);
        debug!(%address, "control plane client configured");
        Ok(Self {
            client: AgentSyncClient::new(endpoint.connect_lazy()),
            config,
        })
    }

    fn request<T>(&self, identity: &AgentIdentity, message: T) -> SyncResult<Request<T>> {
        let mut request = Request::new(message);
        let region = MetadataValue::try_from(identity.region.as_str())
            .map_err(|e| SyncError::InvalidArgument(format!("region metadata: {e}")))?;
        let shard = MetadataValue::try_from(identity.shard.as_str())
            .map_err(|e| SyncError::InvalidArgument(format!("shard metadata: {e}")))?;
        request.metadata_mut().insert(REGION_HEADER, region);
        request.metadata_mut().insert(SHARD_HEADER, shard);
        Ok(request)
    }

    fn watch_request(&self, identity: &AgentIdentity) -> SyncResult<Request<WatchRequest>> {
        self.request(
            identity,
            WatchRequest {
                client_id: identity.client_id.clone(),
                selectors: identity.selectors.clone(),
            },
        )
    }

    async fn unary<F, Fut>(&self, call: F) -> SyncResult<Envelope>
    where
        F: FnOnce(AgentSyncClient<Channel>) -> Fut,
        Fut: Future<Output = Result<tonic::Response<Envelope>, tonic::Status>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call(self.client.clone())).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(status.into()),
            Err(_) => Err(SyncError::DeadlineExceeded(format!(
                "no response within {:?}",
                self.config.request_timeout
            ))),
        }
    }
}

fn decode_stream(stream: tonic::Streaming<Envelope>) -> EventStream {
    Box::pin(stream.map(|item| {
        item.map_err(SyncError::from)
            .and_then(|envelope| envelope.to_value::<InfraEvent>())
    }))
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn watch(&self, identity: &AgentIdentity) -> SyncResult<EventStream> {
        let request = self.watch_request(identity)?;
        let response = self.client.clone().watch(request).await?;
        Ok(decode_stream(response.into_inner()))
    }

    async fn desired_state(&self, identity: &AgentIdentity) -> SyncResult<EventStream> {
        let request = self.watch_request(identity)?;
        let response = self.client.clone().get_desired_state(request).await?;
        Ok(decode_stream(response.into_inner()))
    }

    async fn desired_workload(
        &self,
        identity: &AgentIdentity,
        kind: ResourceKind,
        id: &str,
    ) -> SyncResult<InfraEvent> {
        let body = Envelope::from_json(&WorkloadLookup { id: id.to_string() })?;
        let request = self.request(identity, body)?;
        let envelope = match kind {
            ResourceKind::Deployment => {
                self.unary(|mut c| async move { c.get_desired_deployment_state(request).await })
                    .await?
            }
            ResourceKind::Sentinel => {
                self.unary(|mut c| async move { c.get_desired_sentinel_state(request).await })
                    .await?
            }
            ResourceKind::Gateway => {
                self.unary(|mut c| async move { c.get_desired_gateway_state(request).await })
                    .await?
            }
        };
        envelope.to_value()
    }

    async fn report(&self, identity: &AgentIdentity, update: StatusUpdate) -> SyncResult<()> {
        match update {
            StatusUpdate::Instance(change) => {
                let request = self.request(identity, Envelope::from_json(&change)?)?;
                self.unary(|mut c| async move { c.update_instance_state(request).await })
                    .await?;
            }
            StatusUpdate::Sentinel(report) => {
                let request = self.request(identity, Envelope::from_json(&report)?)?;
                self.unary(|mut c| async move { c.update_sentinel_state(request).await })
                    .await?;
            }
            StatusUpdate::Gateway(report) => {
                let request = self.request(identity, Envelope::from_json(&report)?)?;
                self.unary(|mut c| async move { c.update_gateway_state(request).await })
                    .await?;
            }
            StatusUpdate::Deployment(report) => {
                let request = self.request(identity, Envelope::from_json(&report)?)?;
                self.unary(|mut c| async move { c.update_deployment_status(request).await })
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_address() {
        let result = GrpcControlPlane::connect_lazy("not a uri", ClientConfig::default());
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn requests_carry_agent_metadata() {
        let client =
            GrpcControlPlane::connect_lazy("http://127.0.0.1:1", ClientConfig::default()).unwrap();
        let identity = AgentIdentity::new("agent-1", "us-east-1", "a");
        let request = client.watch_request(&identity).unwrap();
        assert_eq!(request.metadata().get(REGION_HEADER).unwrap(), "us-east-1");
        assert_eq!(request.metadata().get(SHARD_HEADER).unwrap(), "a");
        assert_eq!(request.get_ref().client_id, "agent-1");
    }
}

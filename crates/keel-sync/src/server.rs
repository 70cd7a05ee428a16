//! AgentSync gRPC server — control plane side.
//!
//! Thin adapter from the generated `AgentSync` trait onto [`SyncService`].
//! Streaming and update calls must carry the agent's region and shard in
//! request metadata.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::event::{DeploymentStatusReport, InstanceChange, ResourceKind, WorkloadReport};
use crate::proto::agent_sync_server::{AgentSync, AgentSyncServer};
use crate::proto::{Envelope, REGION_HEADER, SHARD_HEADER, WatchRequest, WorkloadLookup};
use crate::service::SyncService;

type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Envelope, Status>> + Send>>;

/// gRPC implementation of the agent sync service.
pub struct SyncServer {
    service: SyncService,
}

impl SyncServer {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> AgentSyncServer<Self> {
        AgentSyncServer::new(self)
    }

    fn lookup(
        &self,
        request: Request<Envelope>,
        kind: ResourceKind,
    ) -> Result<Response<Envelope>, Status> {
        let lookup: WorkloadLookup = request.into_inner().to_value()?;
        if lookup.id.is_empty() {
            return Err(Status::invalid_argument("id is required"));
        }
        let event = self.service.desired(kind, &lookup.id)?;
        Ok(Response::new(Envelope::from_json(&event)?))
    }
}

/// Region and shard an agent identified itself with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMetadata {
    pub region: String,
    pub shard: String,
}

/// Extract required agent metadata, rejecting the call if any is missing.
pub fn agent_metadata<T>(request: &Request<T>) -> Result<AgentMetadata, Status> {
    let header = |name: &str| -> Result<String, Status> {
        request
            .metadata()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Status::invalid_argument(format!("missing {name} metadata")))
    };
    Ok(AgentMetadata {
        region: header(REGION_HEADER)?,
        shard: header(SHARD_HEADER)?,
    })
}

fn encode_stream(events: crate::control_plane::EventStream) -> EnvelopeStream {
    Box::pin(events.map(|item| {
        item.and_then(|event| Envelope::from_json(&event))
            .map_err(Status::from)
    }))
}

#[tonic::async_trait]
impl AgentSync for SyncServer {
    type WatchStream = EnvelopeStream;
    type GetDesiredStateStream = EnvelopeStream;

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let meta = agent_metadata(&request)?;
        let req = request.into_inner();
        if req.client_id.is_empty() {
            return Err(Status::invalid_argument("client_id is required"));
        }
        info!(
            client_id = %req.client_id,
            region = %meta.region,
            shard = %meta.shard,
            "agent watching"
        );
        let events = self.service.watch(&req.client_id, req.selectors);
        Ok(Response::new(encode_stream(events)))
    }

    async fn get_desired_state(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::GetDesiredStateStream>, Status> {
        let meta = agent_metadata(&request)?;
        let req = request.into_inner();
        let region = req.selectors.get("region").cloned();
        debug!(client_id = %req.client_id, region = ?region, shard = %meta.shard, "full desired state requested");
        let events = self.service.desired_state(region.as_deref());
        Ok(Response::new(encode_stream(events)))
    }

    async fn get_desired_deployment_state(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        self.lookup(request, ResourceKind::Deployment)
    }

    async fn get_desired_sentinel_state(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        self.lookup(request, ResourceKind::Sentinel)
    }

    async fn get_desired_gateway_state(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        self.lookup(request, ResourceKind::Gateway)
    }

    async fn update_instance_state(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        agent_metadata(&request)?;
        let change: InstanceChange = request.into_inner().to_value()?;
        self.service.update_instance_state(change)?;
        Ok(Response::new(Envelope::empty()))
    }

    async fn update_sentinel_state(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        agent_metadata(&request)?;
        let report: WorkloadReport = request.into_inner().to_value()?;
        self.service.update_sentinel_state(report)?;
        Ok(Response::new(Envelope::empty()))
    }

    async fn update_gateway_state(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        agent_metadata(&request)?;
        let report: WorkloadReport = request.into_inner().to_value()?;
        self.service.update_gateway_state(report)?;
        Ok(Response::new(Envelope::empty()))
    }

    async fn update_deployment_status(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        agent_metadata(&request)?;
        let report: DeploymentStatusReport = request.into_inner().to_value()?;
        self.service.update_deployment_status(report)?;
        Ok(Response::new(Envelope::empty()))
    }
}

#[cfg(test)]
mod tests {
    use keel_state::StateStore;
    use tonic::Code;

    use super::*;
    use crate::buffer::BufferConfig;
    use crate::event::InfraEvent;

    fn server() -> SyncServer {
        SyncServer::new(SyncService::new(
            StateStore::open_in_memory().unwrap(),
            BufferConfig::default(),
        ))
    }

    fn with_metadata<T>(mut request: Request<T>) -> Request<T> {
        request
            .metadata_mut()
            .insert(REGION_HEADER, "us-east-1".parse().unwrap());
        request
            .metadata_mut()
            .insert(SHARD_HEADER, "a".parse().unwrap());
        request
    }

    #[tokio::test]
    async fn watch_without_metadata_is_invalid_argument() {
        let request = Request::new(WatchRequest {
            client_id: "agent-1".into(),
            selectors: Default::default(),
        });
        let err = server().watch(request).await.err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn update_without_shard_is_rejected() {
        let mut request = Request::new(Envelope::empty());
        request
            .metadata_mut()
            .insert(REGION_HEADER, "us-east-1".parse().unwrap());
        let err = server().update_gateway_state(request).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn watch_with_metadata_registers_agent() {
        let srv = server();
        let request = with_metadata(Request::new(WatchRequest {
            client_id: "agent-1".into(),
            selectors: Default::default(),
        }));
        let _stream = srv.watch(request).await.unwrap();
        assert!(srv.service.registry().get("agent-1").is_some());
    }

    #[tokio::test]
    async fn lookup_of_unknown_id_returns_delete() {
        let request = Request::new(Envelope::from_json(&WorkloadLookup { id: "d-9".into() }).unwrap());
        let response = server()
            .get_desired_deployment_state(request)
            .await
            .unwrap();
        let event: InfraEvent = response.into_inner().to_value().unwrap();
        assert!(event.is_delete());
    }
}

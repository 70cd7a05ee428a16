//! Per-kind controllers and the router that dispatches events to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use keel_sync::{AgentIdentity, Change, ControlPlane, EventBuffer, InfraEvent, ResourceKind};

use crate::error::{AgentError, AgentResult};
use crate::reconciler::Reconciler;

#[async_trait]
pub trait Controller: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Apply or delete the resource an event describes.
    async fn handle(&self, event: InfraEvent) -> AgentResult<()>;

    /// Re-query the control plane for every local workload of this kind.
    async fn refresh(
        &self,
        plane: &dyn ControlPlane,
        identity: &AgentIdentity,
        sink: &EventBuffer<InfraEvent>,
    ) -> AgentResult<usize>;
}

fn wrong_kind(expected: ResourceKind, event: &InfraEvent) -> AgentError {
    AgentError::WrongKind {
        expected: expected.to_string(),
        got: event.kind().to_string(),
    }
}

macro_rules! controller {
    ($name:ident, $kind:ident, $apply:ident) => {
        pub struct $name {
            reconciler: Arc<Reconciler>,
        }

        impl $name {
            pub fn new(reconciler: Arc<Reconciler>) -> Self {
                Self { reconciler }
            }
        }

        #[async_trait]
        impl Controller for $name {
            fn kind(&self) -> ResourceKind {
                ResourceKind::$kind
            }

            async fn handle(&self, event: InfraEvent) -> AgentResult<()> {
                match event {
                    InfraEvent::$kind(Change::Apply(intent)) => {
                        let outcome = self.reconciler.$apply(&intent).await?;
                        debug!(kind = %self.kind(), ?outcome, "apply handled");
                        Ok(())
                    }
                    InfraEvent::$kind(Change::Delete(target)) => {
                        self.reconciler.delete(ResourceKind::$kind, &target).await?;
                        Ok(())
                    }
                    other => Err(wrong_kind(ResourceKind::$kind, &other)),
                }
            }

            async fn refresh(
                &self,
                plane: &dyn ControlPlane,
                identity: &AgentIdentity,
                sink: &EventBuffer<InfraEvent>,
            ) -> AgentResult<usize> {
                self.reconciler
                    .resync_local(plane, identity, Some(ResourceKind::$kind), sink)
                    .await
            }
        }
    };
}

controller!(DeploymentController, Deployment, apply_deployment);
controller!(SentinelController, Sentinel, apply_sentinel);
controller!(GatewayController, Gateway, apply_gateway);

/// Dispatches events to the controller registered for their kind.
pub struct Router {
    controllers: BTreeMap<ResourceKind, Arc<dyn Controller>>,
}

impl Router {
    /// Router with the deployment, sentinel and gateway controllers.
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            controllers: BTreeMap::new(),
        }
        .with_controller(Arc::new(DeploymentController::new(reconciler.clone())))
        .with_controller(Arc::new(SentinelController::new(reconciler.clone())))
        .with_controller(Arc::new(GatewayController::new(reconciler)))
    }

    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.insert(controller.kind(), controller);
        self
    }

    pub fn controllers(&self) -> impl Iterator<Item = &Arc<dyn Controller>> {
        self.controllers.values()
    }

    pub async fn dispatch(&self, event: InfraEvent) -> AgentResult<()> {
        let kind = event.kind();
        let controller = self.controllers.get(&kind).ok_or_else(|| AgentError::WrongKind {
            expected: "registered controller".to_string(),
            got: kind.to_string(),
        })?;
        controller.handle(event).await
    }
}

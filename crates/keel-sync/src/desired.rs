//! Mapping from stored workload records to desired-state events.
//!
//! A record that should run and passes validation becomes an `Apply`.
//! Anything else (archived, standby, absent) becomes a `Delete`, so a
//! per-resource lookup always gives the agent an actionable answer.

use keel_state::{Deployment, DesiredState, Gateway, Sentinel};

use crate::error::{SyncError, SyncResult};
use crate::event::{
    Change, DeploymentIntent, GatewayIntent, InfraEvent, LABEL_REGION, LABEL_SHARD, Labels,
    ResourceKind, SentinelIntent,
};

/// Orchestrator namespace holding a workspace's workloads.
pub fn namespace_for(workspace_id: &str) -> String {
    workspace_id.to_ascii_lowercase()
}

/// Routing labels for a record placed in `region` and optional `shard`.
pub fn labels_for(region: &str, shard: Option<&str>) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_REGION.to_string(), region.to_string());
    if let Some(shard) = shard {
        labels.insert(LABEL_SHARD.to_string(), shard.to_string());
    }
    labels
}

pub fn deployment_intent(deployment: &Deployment) -> SyncResult<DeploymentIntent> {
    let image = deployment.image.clone().ok_or_else(|| {
        SyncError::InvalidArgument(format!("deployment {} has no image", deployment.id))
    })?;
    let intent = DeploymentIntent {
        deployment_id: deployment.id.clone(),
        workspace_id: deployment.workspace_id.clone(),
        project_id: deployment.project_id.clone(),
        environment_id: deployment.environment_id.clone(),
        namespace: namespace_for(&deployment.workspace_id),
        image,
        region: deployment.region.clone(),
        resources: deployment.resources,
    };
    intent.validate()?;
    Ok(intent)
}

pub fn sentinel_intent(sentinel: &Sentinel) -> SyncResult<SentinelIntent> {
    let intent = SentinelIntent {
        sentinel_id: sentinel.id.clone(),
        workspace_id: sentinel.workspace_id.clone(),
        project_id: sentinel.project_id.clone(),
        environment_id: sentinel.environment_id.clone(),
        namespace: namespace_for(&sentinel.workspace_id),
        image: sentinel.image.clone(),
        region: sentinel.region.clone(),
        resources: sentinel.resources,
    };
    intent.validate()?;
    Ok(intent)
}

pub fn gateway_intent(gateway: &Gateway) -> SyncResult<GatewayIntent> {
    let intent = GatewayIntent {
        gateway_id: gateway.id.clone(),
        workspace_id: gateway.workspace_id.clone(),
        namespace: namespace_for(&gateway.workspace_id),
        image: gateway.image.clone(),
        region: gateway.region.clone(),
        resources: gateway.resources,
    };
    intent.validate()?;
    Ok(intent)
}

/// Desired event for a deployment lookup.
///
/// Validation failures on a running record are returned as errors so the
/// caller can surface them; they are not silently turned into deletes.
pub fn deployment_event(id: &str, record: Option<&Deployment>) -> SyncResult<InfraEvent> {
    match record {
        Some(d) if d.desired_state == DesiredState::Running => {
            Ok(InfraEvent::Deployment(Change::Apply(deployment_intent(d)?)))
        }
        Some(d) => Ok(InfraEvent::delete(
            ResourceKind::Deployment,
            id,
            Some(namespace_for(&d.workspace_id)),
        )),
        None => Ok(InfraEvent::delete(ResourceKind::Deployment, id, None)),
    }
}

pub fn sentinel_event(id: &str, record: Option<&Sentinel>) -> SyncResult<InfraEvent> {
    match record {
        Some(s) if s.desired_state == DesiredState::Running => {
            Ok(InfraEvent::Sentinel(Change::Apply(sentinel_intent(s)?)))
        }
        Some(s) => Ok(InfraEvent::delete(
            ResourceKind::Sentinel,
            id,
            Some(namespace_for(&s.workspace_id)),
        )),
        None => Ok(InfraEvent::delete(ResourceKind::Sentinel, id, None)),
    }
}

pub fn gateway_event(id: &str, record: Option<&Gateway>) -> SyncResult<InfraEvent> {
    match record {
        Some(g) if g.desired_state == DesiredState::Running => {
            Ok(InfraEvent::Gateway(Change::Apply(gateway_intent(g)?)))
        }
        Some(g) => Ok(InfraEvent::delete(
            ResourceKind::Gateway,
            id,
            Some(namespace_for(&g.workspace_id)),
        )),
        None => Ok(InfraEvent::delete(ResourceKind::Gateway, id, None)),
    }
}

#[cfg(test)]
mod tests {
    use keel_state::{DeploymentStatus, Resources};

    use super::*;

    fn deployment(desired_state: DesiredState, image: Option<&str>) -> Deployment {
        Deployment {
            id: "d-1".into(),
            workspace_id: "WS-1".into(),
            project_id: "proj-1".into(),
            environment_id: "env-prod".into(),
            git_commit_sha: None,
            git_branch: None,
            image: image.map(str::to_string),
            region: "us-east-1".into(),
            shard: Some("a".into()),
            resources: Resources {
                replicas: 2,
                cpu_millicores: 250,
                memory_mib: 256,
            },
            desired_state,
            status: DeploymentStatus::Deploying,
            openapi_spec: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn running_deployment_maps_to_apply() {
        let d = deployment(DesiredState::Running, Some("img:1"));
        match deployment_event("d-1", Some(&d)).unwrap() {
            InfraEvent::Deployment(Change::Apply(intent)) => {
                assert_eq!(intent.namespace, "ws-1");
                assert_eq!(intent.resources.replicas, 2);
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn archived_and_absent_map_to_delete() {
        let archived = deployment(DesiredState::Archived, Some("img:1"));
        let event = deployment_event("d-1", Some(&archived)).unwrap();
        assert!(event.is_delete());

        let standby = deployment(DesiredState::Standby, Some("img:1"));
        assert!(deployment_event("d-1", Some(&standby)).unwrap().is_delete());

        let absent = deployment_event("d-404", None).unwrap();
        assert!(absent.is_delete());
        assert_eq!(absent.resource_id(), "d-404");
    }

    #[test]
    fn running_without_image_is_invalid() {
        let d = deployment(DesiredState::Running, None);
        assert!(matches!(
            deployment_event("d-1", Some(&d)),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn labels_include_shard_when_present() {
        let labels = labels_for("us-east-1", Some("a"));
        assert_eq!(labels.get("region").map(String::as_str), Some("us-east-1"));
        assert_eq!(labels.get("shard").map(String::as_str), Some("a"));
        assert!(!labels_for("us-east-1", None).contains_key("shard"));
    }
}

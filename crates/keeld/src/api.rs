//! REST API for deployment management.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/deployments` | Create a deployment (runs in the background) |
//! | GET | `/api/v1/deployments/{id}` | Get a deployment |
//! | GET | `/api/v1/deployments/{id}/progress` | Progress log |
//! | POST | `/api/v1/deployments/{id}/promote` | Make it the live deployment |
//! | POST | `/api/v1/deployments/{id}/rollback` | Roll the live deployment `{id}` back to `target_id` |
//! | GET | `/healthz` | Liveness |

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use keel_workflow::{CreateDeployment, DeploymentService, WorkflowError};

#[derive(Clone)]
pub struct ApiState {
    pub deployments: DeploymentService,
}

pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/deployments", post(create_deployment))
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/{id}/progress", get(get_progress))
        .route("/deployments/{id}/promote", post(promote))
        .route("/deployments/{id}/rollback", post(rollback))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(|| async { "ok" }))
}

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn error_response(err: &WorkflowError) -> Response {
    let status = match err {
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Json(request): Json<CreateDeployment>,
) -> Response {
    match state.deployments.submit_deployment(request) {
        Ok(deployment) => ok(StatusCode::ACCEPTED, deployment),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.deployments.get_deployment(&id) {
        Ok(deployment) => ok(StatusCode::OK, deployment),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/deployments/{id}/progress
pub async fn get_progress(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.deployments.progress(&id) {
        Ok(entries) => ok(StatusCode::OK, entries),
        Err(e) => error_response(&e),
    }
}

/// POST /api/v1/deployments/{id}/promote
pub async fn promote(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.deployments.promote(&id).await {
        Ok(project) => ok(StatusCode::OK, project),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub target_id: String,
}

/// POST /api/v1/deployments/{id}/rollback
pub async fn rollback(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Response {
    match state.deployments.rollback(&id, &request.target_id).await {
        Ok(project) => ok(StatusCode::OK, project),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use keel_state::{
        DeploymentStatus, Environment, Project, Resources, RoutingStore, StateStore, Workspace,
    };
    use keel_sync::{BufferConfig, SyncService};
    use keel_workflow::{
        DeploySource, DeployWorkflow, DomainRouter, HttpSchemaFetcher, SyncPlane, WorkflowConfig,
    };

    use super::*;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workspace(&Workspace {
                id: "ws-1".into(),
                slug: "acme".into(),
                created_at: 0,
            })
            .unwrap();
        store
            .put_project(&Project {
                id: "proj-1".into(),
                workspace_id: "ws-1".into(),
                slug: "shop".into(),
                live_deployment_id: None,
                is_rolled_back: false,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        store
            .put_environment(&Environment {
                id: "env-1".into(),
                workspace_id: "ws-1".into(),
                project_id: "proj-1".into(),
                slug: "production".into(),
                auth_keyspace_id: None,
            })
            .unwrap();

        let routing = RoutingStore::open_in_memory("default").unwrap();
        let sync = SyncService::new(store.clone(), BufferConfig::default());
        let workflow = DeployWorkflow::new(
            store.clone(),
            DomainRouter::new(store.clone(), routing),
            Arc::new(SyncPlane::new(sync)),
            Arc::new(HttpSchemaFetcher::new()),
            WorkflowConfig::default(),
        );
        ApiState {
            deployments: DeploymentService::new(store, workflow),
        }
    }

    fn create_request(image: &str) -> CreateDeployment {
        CreateDeployment {
            workspace_id: "ws-1".into(),
            project_id: "proj-1".into(),
            environment_id: "env-1".into(),
            git_commit_sha: None,
            git_branch: None,
            source: DeploySource::Image {
                image: image.into(),
            },
            region: "us-east-1".into(),
            shard: None,
            resources: Resources {
                replicas: 1,
                cpu_millicores: 100,
                memory_mib: 128,
            },
        }
    }

    #[tokio::test]
    async fn create_is_accepted_as_pending() {
        let state = test_state();
        let resp = create_deployment(
            State(state.clone()),
            Json(create_request("registry.local/shop:1")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "pending");

        let id = json["data"]["id"].as_str().unwrap().to_string();
        let resp = get_deployment(State(state), Path(id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_without_image_is_unprocessable() {
        let resp = create_deployment(State(test_state()), Json(create_request(""))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_deployment_is_not_found() {
        let state = test_state();
        let resp = get_deployment(State(state.clone()), Path("nope".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = promote(State(state), Path("nope".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn promote_of_unready_deployment_is_rejected() {
        let state = test_state();
        let accepted = state
            .deployments
            .submit_deployment(create_request("registry.local/shop:1"))
            .unwrap();
        assert_eq!(accepted.status, DeploymentStatus::Pending);

        let resp = promote(State(state), Path(accepted.id)).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "deployment not ready");
    }

    #[tokio::test]
    async fn router_serves_rollback_route() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(
                Request::post("/api/v1/deployments/nope/rollback")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"target_id":"other"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

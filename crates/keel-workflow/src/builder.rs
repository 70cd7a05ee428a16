//! Image builder abstraction.
//!
//! Deployments that ship source instead of a prebuilt image go through a
//! [`Builder`]: the workflow starts a build, then polls until the build
//! succeeds or fails.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{WorkflowError, WorkflowResult};

/// Where the source to build lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    pub context_url: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
}

/// A started build and the image it will produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTicket {
    pub build_id: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed { reason: String },
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn create_build(&self, project_id: &str, context: &BuildContext)
    -> WorkflowResult<BuildTicket>;

    async fn build_status(&self, build_id: &str) -> WorkflowResult<BuildStatus>;
}

/// Poll `ticket` until the build finishes. Returns the image on success.
pub async fn wait_for_build(
    builder: &dyn Builder,
    ticket: &BuildTicket,
    interval: Duration,
    max_polls: u32,
) -> WorkflowResult<String> {
    for attempt in 1..=max_polls {
        match builder.build_status(&ticket.build_id).await? {
            BuildStatus::Succeeded => {
                info!(build_id = %ticket.build_id, image = %ticket.image, "build succeeded");
                return Ok(ticket.image.clone());
            }
            BuildStatus::Failed { reason } => {
                return Err(WorkflowError::Build(reason));
            }
            status => {
                debug!(build_id = %ticket.build_id, attempt, ?status, "build in progress");
            }
        }
        tokio::time::sleep(interval).await;
    }
    Err(WorkflowError::Timeout(format!(
        "build {} did not finish after {max_polls} polls",
        ticket.build_id
    )))
}

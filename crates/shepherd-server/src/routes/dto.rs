//! Request/response schemas for the public and internal HTTP surfaces
//! (§6.1, §6.2).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shepherd_k8s::Task;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub repo: RepoRequest,
    pub task: TaskRequest,
    #[serde(rename = "callbackUrl")]
    pub callback_url: String,
    #[serde(default)]
    pub runner: RunnerRequest,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RepoRequest {
    pub url: String,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default, rename = "sourceURL")]
    pub source_url: Option<String>,
    #[serde(default, rename = "sourceType")]
    pub source_type: Option<String>,
    #[serde(default, rename = "sourceID")]
    pub source_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunnerRequest {
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default, rename = "serviceAccountName")]
    pub service_account_name: Option<String>,
    #[serde(default, rename = "sandboxTemplateName")]
    pub sandbox_template_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    #[serde(rename = "prURL", skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub phase: String,
    pub result: ResultResponse,
}

/// Projects a stored `Task` the way API clients see it: `status.phase`
/// derived from `Succeeded`'s reason, never the raw condition list.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub repo: RepoResponse,
    pub description: String,
    #[serde(rename = "callbackUrl")]
    pub callback_url: String,
    pub labels: BTreeMap<String, String>,
    pub status: StatusResponse,
}

#[derive(Debug, Serialize)]
pub struct RepoResponse {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "ref")]
    pub git_ref: Option<String>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        let status = task.status.clone().unwrap_or_default();
        Self {
            id: task.metadata.name.clone().unwrap_or_default(),
            repo: RepoResponse {
                url: task.spec.repo.url.clone(),
                git_ref: task.spec.repo.git_ref.clone(),
            },
            description: task.spec.task.description.clone(),
            callback_url: task.spec.callback.url.clone(),
            labels: task
                .metadata
                .labels
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            status: StatusResponse {
                phase: status.phase().to_string(),
                result: ResultResponse {
                    pr_url: status.result.pr_url.clone(),
                    error: status.result.error.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub event: String,
    pub message: String,
    #[serde(default)]
    pub details: StatusDetails,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusDetails {
    #[serde(default, rename = "pr_url")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub sequence: u64,
    #[serde(rename = "type")]
    pub type_: String,
    pub summary: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct EventBatchRequest {
    pub events: Vec<EventRequest>,
}

#[derive(Debug, Serialize)]
pub struct TaskDataResponse {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Echoes the request's `task.sourceURL` (stored as `spec.task.contextURL`
    /// -- the two names refer to the same field; see DESIGN.md).
    #[serde(rename = "sourceURL", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub repo: RepoResponse,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

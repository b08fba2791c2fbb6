//! Public-surface handlers: create/list/get tasks (§4.3.1, §4.3.2).

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use kube::Resource;
use rand::Rng;
use shepherd_core::compress_context;
use shepherd_k8s::crd::{CallbackSpec, RepoSpec, RunnerSpec, TaskDetail, TaskSpecInner};
use shepherd_k8s::label::{ListFilter, LABEL_SOURCE_ID, LABEL_SOURCE_TYPE};
use shepherd_k8s::{Task, TaskStatus};
use tracing::instrument;

use crate::error::{require_json_content_type, ApiError};
use crate::routes::dto::{CreateTaskRequest, TaskResponse};
use crate::state::ServerState;
use crate::validate;

const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn generate_task_name() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..8)
        .map(|_| NAME_CHARSET[rng.random_range(0..NAME_CHARSET.len())] as char)
        .collect();
    format!("task-{suffix}")
}

#[instrument(skip(state, headers, body))]
pub async fn create_task(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    require_json_content_type(&headers)?;

    if body.task.description.trim().is_empty() {
        return Err(ApiError::BadRequest("task.description must not be empty".to_string()));
    }
    validate::validate_repo_url(&body.repo.url).map_err(ApiError::BadRequest)?;
    validate::validate_callback_url(&body.callback_url).map_err(ApiError::BadRequest)?;

    let (context, context_encoding) = match &body.task.context {
        Some(context) if !context.is_empty() => {
            let (encoded, len) = compress_context(context)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            if len > state.context_compression_threshold_bytes {
                return Err(ApiError::PayloadTooLarge(format!(
                    "compressed context of {len} bytes exceeds the {} byte limit",
                    state.context_compression_threshold_bytes
                )));
            }
            (Some(encoded), Some("gzip".to_string()))
        }
        _ => (None, None),
    };

    let name = generate_task_name();
    let mut labels = body.labels.clone();
    if let Some(source_type) = &body.task.source_type {
        labels.insert(LABEL_SOURCE_TYPE.to_string(), source_type.clone());
    }
    if let Some(source_id) = &body.task.source_id {
        labels.insert(LABEL_SOURCE_ID.to_string(), source_id.clone());
    }

    let task = Task::new(
        &name,
        TaskSpecInner {
            repo: RepoSpec {
                url: body.repo.url.clone(),
                git_ref: body.repo.git_ref.clone(),
            },
            task: TaskDetail {
                description: body.task.description.clone(),
                context,
                context_encoding,
                context_url: body.task.source_url.clone(),
                source_type: body.task.source_type.clone(),
                source_id: body.task.source_id.clone(),
            },
            callback: CallbackSpec {
                url: body.callback_url.clone(),
            },
            runner: RunnerSpec {
                image: None,
                timeout: body.runner.timeout.clone(),
                service_account_name: body.runner.service_account_name.clone(),
                resources: None,
                sandbox_template_name: body.runner.sandbox_template_name.clone(),
            },
        },
    );
    let mut task = task;
    task.meta_mut().labels = Some(labels.into_iter().collect());
    task.status = Some(TaskStatus::default());

    let created = state.store.create(task).await?;
    Ok((StatusCode::CREATED, Json(TaskResponse::from(&created))))
}

#[derive(Debug, serde::Deserialize)]
pub struct ListQuery {
    pub repo: Option<String>,
    pub issue: Option<String>,
    pub fleet: Option<String>,
    #[serde(default)]
    pub active: bool,
}

#[instrument(skip(state))]
pub async fn list_tasks(
    State(state): State<ServerState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let filter = ListFilter {
        repo: query.repo,
        issue: query.issue,
        fleet: query.fleet,
        active_only: query.active,
    };
    let tasks = state.store.list(&filter).await?;
    let filtered = filter.apply_active_filter(&tasks);
    Ok(Json(filtered.into_iter().map(TaskResponse::from).collect()))
}

#[instrument(skip(state))]
pub async fn get_task(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    Ok(Json(TaskResponse::from(&task)))
}

//! Internal-surface handlers: agent status/events/data/token (§4.3.3-§4.3.6).

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use shepherd_core::credential::IssueTokenOutcome;
use shepherd_core::watcher::CALLBACK_PENDING_TTL;
use shepherd_core::{decompress_context, CallbackDetails, CallbackPayload, Event, EventType, TaskOutcome};
use shepherd_k8s::{ConditionStatus, ConditionType, TaskStoreError};
use tracing::{instrument, warn};

use crate::error::{require_json_content_type, ApiError};
use crate::routes::dto::{EventBatchRequest, StatusRequest, TaskDataResponse, TokenResponse};
use crate::state::ServerState;

fn parse_event_type(raw: &str) -> Result<EventType, ApiError> {
    match raw {
        "thinking" => Ok(EventType::Thinking),
        "tool_call" => Ok(EventType::ToolCall),
        "tool_result" => Ok(EventType::ToolResult),
        "error" => Ok(EventType::Error),
        other => Err(ApiError::BadRequest(format!("unknown event type {other}"))),
    }
}

/// §4.3.3. Non-terminal events forward to the adapter without mutating task
/// status; terminal events run the claim/dispatch/finalize sequence that
/// races the status watcher over the `Notified` condition.
#[instrument(skip(state, headers, body), fields(task_id = %id))]
pub async fn post_status(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_json_content_type(&headers)?;

    let is_terminal_event = matches!(body.event.as_str(), "completed" | "failed");
    if !is_terminal_event {
        if !matches!(body.event.as_str(), "started" | "progress") {
            return Err(ApiError::BadRequest(format!("unknown event {}", body.event)));
        }
        let task = state
            .store
            .get(&id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
        let payload = CallbackPayload {
            task_id: id.clone(),
            event: body.event.clone(),
            message: body.message.clone(),
            details: None,
        };
        if let Err(e) = state.callback.send(&task.spec.callback.url, &payload).await {
            warn!(error = %e, "non-terminal callback failed");
        }
        return Ok(Json(serde_json::json!({ "status": "accepted" })));
    }

    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    let mut status = task.status.clone().unwrap_or_default();

    if let Some(notified) = status.find_condition(ConditionType::Notified) {
        if notified.reason == "CallbackSent" || notified.reason == "CallbackFailed" {
            return Ok(Json(serde_json::json!({ "status": "already notified" })));
        }
        if notified.reason == "CallbackPending" {
            let age = chrono::Utc::now() - notified.last_transition_time.0;
            if age < CALLBACK_PENDING_TTL {
                return Ok(Json(serde_json::json!({ "status": "callback pending" })));
            }
        }
    }

    let generation = task.metadata.generation.unwrap_or(0);
    if body.event == "completed" {
        status.result.pr_url = body.details.pr_url.clone();
    } else {
        status.result.error = body.details.error.clone();
    }
    status.set_condition(
        ConditionType::Notified,
        ConditionStatus::Unknown,
        "CallbackPending",
        "status handler claimed terminal dispatch",
        generation,
    );

    let version = task.metadata.resource_version.clone().unwrap_or_default();
    let claimed = match state.store.update_status(&id, &version, status).await {
        Ok(task) => task,
        Err(TaskStoreError::Conflict { .. }) => {
            return Ok(Json(serde_json::json!({ "status": "accepted" })));
        }
        Err(e) => return Err(e.into()),
    };

    let payload = CallbackPayload {
        task_id: id.clone(),
        event: body.event.clone(),
        message: body.message.clone(),
        details: Some(CallbackDetails {
            pr_url: body.details.pr_url.clone(),
            error: body.details.error.clone(),
        }),
    };
    let send_result = state.callback.send(&claimed.spec.callback.url, &payload).await;
    let (reason, message) = match &send_result {
        Ok(()) => ("CallbackSent", "terminal callback delivered".to_string()),
        Err(e) => ("CallbackFailed", e.to_string()),
    };

    state.events.complete(
        &id,
        TaskOutcome {
            task_id: id.clone(),
            phase: if body.event == "completed" { "Succeeded" } else { "Failed" }.to_string(),
            pr_url: body.details.pr_url.clone(),
            error: body.details.error.clone(),
        },
    );

    if let Ok(Some(fresh)) = state.store.get(&id).await {
        let mut final_status = fresh.status.clone().unwrap_or_default();
        final_status.set_condition(ConditionType::Notified, ConditionStatus::True, reason, message, generation);
        if let Some(fresh_version) = fresh.metadata.resource_version.clone() {
            if let Err(e) = state.store.update_status(&id, &fresh_version, final_status).await {
                warn!(error = %e, "failed to finalize Notified condition, TTL-based re-claim will recover");
            }
        }
    }

    Ok(Json(serde_json::json!({ "status": "accepted" })))
}

/// §4.3.4 POST. Rejects events for terminal tasks with 410 Gone.
#[instrument(skip(state, body), fields(task_id = %id))]
pub async fn post_events(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(body): Json<EventBatchRequest>,
) -> Result<StatusCode, ApiError> {
    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    let status = task.status.clone().unwrap_or_default();
    if status.is_terminal() {
        return Err(ApiError::Gone(format!("task {id} is terminal")));
    }

    let mut events = Vec::with_capacity(body.events.len());
    for raw in body.events {
        if raw.summary.trim().is_empty() {
            return Err(ApiError::BadRequest("event summary must not be empty".to_string()));
        }
        events.push(Event {
            sequence: raw.sequence,
            timestamp: chrono::Utc::now(),
            type_: parse_event_type(&raw.type_)?,
            summary: raw.summary,
            tool: raw.tool,
            input: raw.input,
            output: raw.output,
        });
    }
    state.events.publish(&id, events);
    Ok(StatusCode::OK)
}

/// §4.3.5. 410 Gone for terminal tasks.
#[instrument(skip(state), fields(task_id = %id))]
pub async fn get_data(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDataResponse>, ApiError> {
    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    let status = task.status.clone().unwrap_or_default();
    if status.is_terminal() {
        return Err(ApiError::Gone(format!("task {id} is terminal")));
    }

    let context = match (&task.spec.task.context, task.spec.task.context_encoding.as_deref()) {
        (Some(encoded), Some("gzip")) => {
            Some(decompress_context(encoded).map_err(|e| ApiError::Internal(e.to_string()))?)
        }
        (Some(plain), _) => Some(plain.clone()),
        (None, _) => None,
    };

    Ok(Json(TaskDataResponse {
        description: task.spec.task.description.clone(),
        context,
        source_url: task.spec.task.context_url.clone(),
        repo: crate::routes::dto::RepoResponse {
            url: task.spec.repo.url.clone(),
            git_ref: task.spec.repo.git_ref.clone(),
        },
    }))
}

/// §4.3.6. One scoped token per task execution.
#[instrument(skip(state), fields(task_id = %id))]
pub async fn get_token(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<TokenResponse>, ApiError> {
    let creds = state.app_credentials.as_deref();
    match shepherd_core::credential::issue_token(state.store.as_ref(), &id, creds, &state.http).await {
        IssueTokenOutcome::Issued(token) => Ok(Json(TokenResponse {
            token: token.token,
            expires_at: token.expires_at,
        })),
        IssueTokenOutcome::NotFound => Err(ApiError::NotFound(format!("task {id} not found"))),
        IssueTokenOutcome::Terminal => Err(ApiError::Gone(format!("task {id} is terminal"))),
        IssueTokenOutcome::NoAppConfigured => {
            Err(ApiError::ServiceUnavailable("no source-hosting App configured".to_string()))
        }
        IssueTokenOutcome::AlreadyIssued => {
            Err(ApiError::Conflict("token already issued for this execution".to_string()))
        }
        IssueTokenOutcome::ClaimConflict => {
            Err(ApiError::Conflict("token already issued for this execution".to_string()))
        }
        IssueTokenOutcome::MintFailed(e) => Err(ApiError::BadGateway(e.to_string())),
    }
}

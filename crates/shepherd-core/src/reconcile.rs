//! Reconciliation controller: task -> workload creation, workload status ->
//! task condition projection (§4.2).

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter};
use kube::{Api, Resource};
use shepherd_k8s::{
    build_job, classify_job_failure, job_name, ConditionStatus, ConditionType, FailedReason,
    FailureClass, OperatorConfig, Task, TaskStore,
};
use tracing::{info, instrument, warn};

use crate::error::ReconcileError;

/// Shared across every `reconcile`/`error_policy` invocation.
pub struct ReconcilerContext {
    pub store: Arc<dyn TaskStore>,
    pub jobs: Api<k8s_openapi::api::batch::v1::Job>,
    pub pods: Api<k8s_openapi::api::core::v1::Pod>,
    pub config: OperatorConfig,
    pub client: kube::Client,
    pub reporter: Reporter,
}

/// Publishes a Kubernetes-style Event against the task (§4.2 step 4,
/// §4.2.2). Best-effort: a failure to publish is logged and never fails
/// the reconcile itself.
async fn emit_event(ctx: &ReconcilerContext, task: &Task, type_: KubeEventType, reason: &str, note: String) {
    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let event = KubeEvent {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: reason.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &task.object_ref(&())).await {
        warn!(error = %e, "failed to publish Kubernetes event");
    }
}

const SHORT_REQUEUE: Duration = Duration::from_secs(1);

/// Entry point wired into `kube::runtime::Controller::run`.
#[instrument(skip(task, ctx), fields(task_name = %task.metadata.name.clone().unwrap_or_default()))]
pub async fn reconcile(task: Arc<Task>, ctx: Arc<ReconcilerContext>) -> Result<Action, ReconcileError> {
    let name = task.metadata.name.clone().unwrap_or_default();
    let generation = task.metadata.generation.unwrap_or(0);

    let Some(current) = ctx.store.get(&name).await? else {
        return Ok(Action::await_change());
    };
    let mut status = current.status.clone().unwrap_or_default();

    if status.is_terminal() {
        return Ok(Action::await_change());
    }

    let Some(version) = current.metadata.resource_version.clone() else {
        return Ok(Action::await_change());
    };

    if status.find_condition(ConditionType::Succeeded).is_none() {
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::Unknown,
            "Pending",
            "waiting for workload to start",
            generation,
        );
        ctx.store.update_status(&name, &version, status).await?;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let Ok(expected_job_name) = job_name(&name, generation) else {
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::False,
            FailedReason::Failed.to_string(),
            "generated workload name exceeds the cluster's name length limit",
            generation,
        );
        ctx.store.update_status(&name, &version, status).await?;
        return Ok(Action::await_change());
    };

    match ctx.jobs.get_opt(&expected_job_name).await.map_err(|e| {
        ReconcileError::WorkloadBuild(format!("failed to look up job {expected_job_name}: {e}"))
    })? {
        None => create_workload(&ctx, &name, &version, &task, &mut status, generation, &expected_job_name).await,
        Some(job) => project_workload_status(&ctx, &name, &version, &task, &mut status, generation, &job).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn create_workload(
    ctx: &ReconcilerContext,
    name: &str,
    version: &str,
    task: &Task,
    status: &mut shepherd_k8s::TaskStatus,
    generation: i64,
    expected_job_name: &str,
) -> Result<Action, ReconcileError> {
    match build_job(task, &ctx.config, generation) {
        Ok(job) => {
            ctx.jobs
                .create(&Default::default(), &job)
                .await
                .map_err(|e| ReconcileError::WorkloadBuild(format!("failed to create job: {e}")))?;

            status.start_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
            status.job_name = Some(expected_job_name.to_string());
            status.set_condition(
                ConditionType::Succeeded,
                ConditionStatus::Unknown,
                "Running",
                "workload created",
                generation,
            );
            ctx.store.update_status(name, version, status.clone()).await?;
            info!(job_name = expected_job_name, "created child workload");
            emit_event(
                ctx,
                task,
                KubeEventType::Normal,
                "WorkloadCreated",
                format!("created job {expected_job_name}"),
            )
            .await;
            Ok(Action::await_change())
        }
        Err(e) => {
            warn!(error = %e, "operator misconfiguration, task cannot be scheduled");
            status.set_condition(
                ConditionType::Succeeded,
                ConditionStatus::False,
                FailedReason::Failed.to_string(),
                e.to_string(),
                generation,
            );
            ctx.store.update_status(name, version, status.clone()).await?;
            emit_event(ctx, task, KubeEventType::Warning, "MisconfiguredOperator", e.to_string()).await;
            Ok(Action::await_change())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn project_workload_status(
    ctx: &ReconcilerContext,
    name: &str,
    version: &str,
    task: &Task,
    status: &mut shepherd_k8s::TaskStatus,
    generation: i64,
    job: &k8s_openapi::api::batch::v1::Job,
) -> Result<Action, ReconcileError> {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();

    let succeeded = conditions
        .iter()
        .any(|c| c.type_ == "Complete" && c.status == "True");
    let failed = conditions
        .iter()
        .any(|c| c.type_ == "Failed" && c.status == "True");

    if succeeded {
        status.completion_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::True,
            "Succeeded",
            "workload completed",
            generation,
        );
        ctx.store.update_status(name, version, status.clone()).await?;
        info!("task succeeded");
        emit_event(ctx, task, KubeEventType::Normal, "TaskSucceeded", "workload completed".to_string()).await;
        return Ok(Action::await_change());
    }

    if failed {
        let pods = list_owned_pods(ctx, name).await.unwrap_or_default();
        let class = classify_job_failure(job, &pods);
        apply_failure_class(status, class, generation);
        status.completion_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        ctx.store.update_status(name, version, status.clone()).await?;
        let message = status.result.error.clone().unwrap_or_else(|| "task failed".to_string());
        warn!(reason = ?status.find_condition(ConditionType::Succeeded), "task failed");
        emit_event(ctx, task, KubeEventType::Warning, "TaskFailed", message).await;
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(Duration::from_secs(5)))
}

fn apply_failure_class(status: &mut shepherd_k8s::TaskStatus, class: FailureClass, generation: i64) {
    let (reason, message): (FailedReason, String) = match class {
        FailureClass::TimedOut => (FailedReason::TimedOut, "Job exceeded timeout".to_string()),
        FailureClass::Oom => (FailedReason::Oom, "container was OOM-killed".to_string()),
        FailureClass::Infrastructure { message } => (FailedReason::Failed, message),
        FailureClass::Application { message } => (FailedReason::Failed, message),
    };
    status.result.error = Some(message.clone());
    status.set_condition(
        ConditionType::Succeeded,
        ConditionStatus::False,
        reason.to_string(),
        message,
        generation,
    );
}

async fn list_owned_pods(
    ctx: &ReconcilerContext,
    task_name: &str,
) -> Result<Vec<k8s_openapi::api::core::v1::Pod>, kube::Error> {
    let selector = format!("{}={}", shepherd_k8s::label::LABEL_TASK, task_name);
    let list = ctx
        .pods
        .list(&kube::api::ListParams::default().labels(&selector))
        .await?;
    Ok(list.items)
}

/// Consulted by `kube::runtime::Controller::run` when `reconcile` errors.
/// Always requeues with a short backoff; terminal misconfiguration is
/// handled inside `reconcile` itself by writing a terminal condition rather
/// than by returning an error, so it is never requeued.
pub fn error_policy(task: Arc<Task>, error: &ReconcileError, ctx: Arc<ReconcilerContext>) -> Action {
    warn!(error = %error, "reconcile failed, requeuing");
    let message = error.to_string();
    tokio::spawn(async move {
        emit_event(&ctx, &task, KubeEventType::Warning, "ReconcileError", message).await;
    });
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_test_utils::{sample_task, InMemoryTaskStore};

    #[tokio::test]
    async fn fresh_task_has_no_succeeded_condition_yet() {
        let store = InMemoryTaskStore::new();
        let task = store.create(sample_task("task-abc123")).await.unwrap();

        let mut status = task.status.clone().unwrap_or_default();
        assert!(status.find_condition(ConditionType::Succeeded).is_none());
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::Unknown,
            "Pending",
            "waiting for workload to start",
            1,
        );
        assert_eq!(status.phase(), "Pending");
    }

    #[test]
    fn failure_class_maps_to_expected_reason() {
        let mut status = shepherd_k8s::TaskStatus::default();
        apply_failure_class(&mut status, FailureClass::TimedOut, 1);
        assert_eq!(status.phase(), "TimedOut");

        let mut status = shepherd_k8s::TaskStatus::default();
        apply_failure_class(&mut status, FailureClass::Oom, 1);
        assert_eq!(status.phase(), "OOM");

        let mut status = shepherd_k8s::TaskStatus::default();
        apply_failure_class(
            &mut status,
            FailureClass::Application {
                message: "exit 1".to_string(),
            },
            1,
        );
        assert_eq!(status.phase(), "Failed");
        assert_eq!(status.result.error.as_deref(), Some("exit 1"));
    }
}

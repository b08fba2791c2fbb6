//! Child workload construction and failure classification (§4.2.1, §4.2.2).

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{
    Job, JobSpec, PodFailurePolicy, PodFailurePolicyOnExitCodesRequirement,
    PodFailurePolicyOnPodConditionsPattern, PodFailurePolicyRule,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, EmptyDirVolumeSource, EnvVar, Pod, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, SeccompProfile, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crd::Task;
use crate::label::LABEL_TASK;

/// Operator-global configuration that parameterizes every workload. Values
/// here, never `spec.runner.image`, determine the image that actually runs
/// (§4.2.1: "never from spec.runner.image").
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub allowed_runner_image: String,
    pub init_image: String,
    pub runner_secret_name: String,
    pub app_id: i64,
    pub installation_id: i64,
    pub api_url: String,
    pub internal_api_base_url: String,
}

/// Errors that are operator misconfiguration, not task-level failures.
/// These become a permanent `Failed` terminal condition and are never
/// retried (§4.2.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("operator misconfiguration: allowedRunnerImage is empty")]
    MissingRunnerImage,

    #[error("operator misconfiguration: initImage is empty")]
    MissingInitImage,

    #[error("operator misconfiguration: appID must be positive")]
    InvalidAppId,

    #[error("operator misconfiguration: installationID must be positive")]
    InvalidInstallationId,

    #[error("generated workload name {0:?} exceeds the cluster's 63-character limit")]
    NameTooLong(String),
}

/// Deterministic workload name: `{task-name}-{generation}-job`.
pub fn job_name(task_name: &str, generation: i64) -> Result<String, WorkloadError> {
    let name = format!("{task_name}-{generation}-job");
    if name.len() > 63 {
        return Err(WorkloadError::NameTooLong(name));
    }
    Ok(name)
}

/// Build the child `Job` for a task, per §4.2.1. `generation` is the task's
/// `metadata.generation`, included in the workload name so a respec (should
/// one ever be forced by an operator, bypassing the immutability rule) does
/// not collide with a prior attempt's workload.
pub fn build_job(task: &Task, config: &OperatorConfig, generation: i64) -> Result<Job, WorkloadError> {
    if config.allowed_runner_image.trim().is_empty() {
        return Err(WorkloadError::MissingRunnerImage);
    }
    if config.init_image.trim().is_empty() {
        return Err(WorkloadError::MissingInitImage);
    }
    if config.app_id <= 0 {
        return Err(WorkloadError::InvalidAppId);
    }
    if config.installation_id <= 0 {
        return Err(WorkloadError::InvalidInstallationId);
    }

    let task_name = task.name_any();
    let name = job_name(&task_name, generation)?;
    let timeout_secs = task.spec.runner.timeout_secs();

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_TASK.to_string(), task_name.clone());

    let owner_ref = OwnerReference {
        api_version: Task::api_version(&()).to_string(),
        kind: Task::kind(&()).to_string(),
        name: task_name.clone(),
        uid: task.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let task_env = vec![
        env("SHEPHERD_TASK_ID", &task_name),
        env("SHEPHERD_REPO_URL", &task.spec.repo.url),
        env(
            "SHEPHERD_REPO_REF",
            task.spec.repo.git_ref.as_deref().unwrap_or(""),
        ),
        env("SHEPHERD_CALLBACK_URL", &task.spec.callback.url),
        env("SHEPHERD_API_URL", &config.internal_api_base_url),
        env("SHEPHERD_TASK_DESCRIPTION_FILE", "/task/description"),
        env("SHEPHERD_TASK_CONTEXT_FILE", "/task/context"),
    ];

    let init_env = vec![
        env("SHEPHERD_TASK_ID", &task_name),
        env("SHEPHERD_APP_ID", &config.app_id.to_string()),
        env("SHEPHERD_INSTALLATION_ID", &config.installation_id.to_string()),
        env("SHEPHERD_APP_API_URL", &config.api_url),
        env("SHEPHERD_API_URL", &config.internal_api_base_url),
    ];

    let security_context = PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(65532),
        run_as_group: Some(65532),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    };

    let task_volume = Volume {
        name: "task".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    let creds_volume = Volume {
        name: "creds".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    let small_static_resources = Some(ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), quantity("50m")),
            ("memory".to_string(), quantity("64Mi")),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), quantity("200m")),
            ("memory".to_string(), quantity("128Mi")),
        ])),
        ..Default::default()
    });

    let init_container = Container {
        name: "init".to_string(),
        image: Some(config.init_image.clone()),
        env: Some(init_env),
        resources: small_static_resources,
        volume_mounts: Some(vec![
            VolumeMount {
                name: "task".to_string(),
                mount_path: "/task".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "creds".to_string(),
                mount_path: "/creds".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let agent_container = Container {
        name: "agent".to_string(),
        image: Some(config.allowed_runner_image.clone()),
        env: Some(task_env),
        resources: task.spec.runner.resources.clone(),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "task".to_string(),
                mount_path: "/task".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "creds".to_string(),
                mount_path: "/creds".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        init_containers: Some(vec![init_container]),
        containers: vec![agent_container],
        volumes: Some(vec![task_volume, creds_volume]),
        restart_policy: Some("Never".to_string()),
        service_account_name: task.spec.runner.service_account_name.clone(),
        security_context: Some(security_context),
        active_deadline_seconds: Some(timeout_secs),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: task.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(timeout_secs),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta::default()),
                spec: Some(pod_spec),
            },
            pod_failure_policy: Some(pod_failure_policy()),
            ..Default::default()
        }),
        status: None,
    };

    Ok(job)
}

/// Pod-failure policy backing `classify_job_failure`'s condition-based OOM
/// branch (§3.2, §4.2.2): exit code 137 always fails the job, and a
/// pod-disruption condition (node drain, preemption) is ignored rather than
/// counted as an application failure.
fn pod_failure_policy() -> PodFailurePolicy {
    PodFailurePolicy {
        rules: vec![
            PodFailurePolicyRule {
                action: "Ignore".to_string(),
                on_exit_codes: None,
                on_pod_conditions: Some(vec![PodFailurePolicyOnPodConditionsPattern {
                    type_: "DisruptionTarget".to_string(),
                    status: "True".to_string(),
                }]),
            },
            PodFailurePolicyRule {
                action: "FailJob".to_string(),
                on_exit_codes: Some(PodFailurePolicyOnExitCodesRequirement {
                    container_name: None,
                    operator: "In".to_string(),
                    values: vec![137],
                }),
                on_pod_conditions: None,
            },
        ],
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn quantity(s: &str) -> k8s_openapi::apimachinery::pkg::api::resource::Quantity {
    k8s_openapi::apimachinery::pkg::api::resource::Quantity(s.to_string())
}

/// The tagged outcome of classifying a failed job, per §4.2.2 and the §9
/// design note on tagged variants over dynamic dispatch. One function
/// produces one tag; the reconciler maps the tag to a `Succeeded` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// `activeDeadlineSeconds` was exceeded.
    TimedOut,
    /// A container exited 137 under a matched pod-failure-policy rule, or a
    /// container status shows `OOMKilled`.
    Oom,
    /// The pod was evicted or is missing entirely. MVP treats this as a
    /// permanent failure rather than retrying the workload (§9 open
    /// question, decided in DESIGN.md).
    Infrastructure { message: String },
    /// Anything else: a genuine application-level non-zero exit.
    Application { message: String },
}

/// Classifies a failed `Job` against its owned pods. Pure function: no I/O,
/// no side effects, so it is trivially unit-testable (§9).
pub fn classify_job_failure(job: &Job, pods: &[Pod]) -> FailureClass {
    if let Some(conditions) = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
    {
        for cond in conditions {
            if cond.type_ == "Failed" && cond.status == "True" {
                if cond.reason.as_deref() == Some("DeadlineExceeded") {
                    return FailureClass::TimedOut;
                }
                if cond
                    .message
                    .as_deref()
                    .is_some_and(|m| m.contains("137"))
                {
                    return FailureClass::Oom;
                }
            }
        }
    }

    for pod in pods {
        if let Some(reason) = pod.status.as_ref().and_then(|s| s.reason.as_deref()) {
            if reason == "Evicted" {
                return FailureClass::Infrastructure {
                    message: format!("pod {} was evicted", pod.name_any()),
                };
            }
        }

        if let Some(class) = classify_container_statuses(pod) {
            return class;
        }
    }

    if pods.is_empty() {
        return FailureClass::Infrastructure {
            message: "no pods found for failed job".to_string(),
        };
    }

    FailureClass::Application {
        message: job
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Failed"))
            .and_then(|c| c.message.clone())
            .unwrap_or_else(|| "job failed".to_string()),
    }
}

fn classify_container_statuses(pod: &Pod) -> Option<FailureClass> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for status in statuses {
        if let Some(class) = classify_one_container(status) {
            return Some(class);
        }
    }
    None
}

fn classify_one_container(status: &ContainerStatus) -> Option<FailureClass> {
    let terminated = status.state.as_ref()?.terminated.as_ref()?;
    if terminated.exit_code == 0 {
        return None;
    }
    if terminated.exit_code == 137 || terminated.reason.as_deref() == Some("OOMKilled") {
        return Some(FailureClass::Oom);
    }
    Some(FailureClass::Application {
        message: format!(
            "container {} exited {} ({})",
            status.name,
            terminated.exit_code,
            terminated.reason.as_deref().unwrap_or("unknown"),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CallbackSpec, RepoSpec, RunnerSpec, TaskDetail, TaskSpecInner, TaskStatus};
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, PodStatus};
    use kube::api::ObjectMeta as KubeObjectMeta;

    fn sample_task(name: &str) -> Task {
        Task {
            metadata: KubeObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("11111111-1111-1111-1111-111111111111".to_string()),
                ..Default::default()
            },
            spec: TaskSpecInner {
                repo: RepoSpec {
                    url: "https://github.com/acme/widget.git".to_string(),
                    git_ref: None,
                },
                task: TaskDetail {
                    description: "Fix login".to_string(),
                    context: None,
                    context_encoding: None,
                    context_url: None,
                    source_type: None,
                    source_id: None,
                },
                callback: CallbackSpec {
                    url: "https://adapter.example/cb".to_string(),
                },
                runner: RunnerSpec::default(),
            },
            status: Some(TaskStatus::default()),
        }
    }

    fn sample_config() -> OperatorConfig {
        OperatorConfig {
            allowed_runner_image: "ghcr.io/acme/runner:v1".to_string(),
            init_image: "ghcr.io/acme/init:v1".to_string(),
            runner_secret_name: "shepherd-runner-creds".to_string(),
            app_id: 12345,
            installation_id: 67890,
            api_url: "https://api.github.com".to_string(),
            internal_api_base_url: "http://shepherd-internal.shepherd.svc:8081".to_string(),
        }
    }

    #[test]
    fn job_name_is_deterministic() {
        assert_eq!(job_name("task-a1b2c3d4", 1).unwrap(), "task-a1b2c3d4-1-job");
    }

    #[test]
    fn job_name_rejects_over_limit() {
        let long_name = "t".repeat(60);
        assert!(matches!(
            job_name(&long_name, 1),
            Err(WorkloadError::NameTooLong(_))
        ));
    }

    #[test]
    fn build_job_uses_operator_image_not_spec_image() {
        let mut task = sample_task("task-a1b2c3d4");
        task.spec.runner.image = Some("attacker/evil:latest".to_string());
        let config = sample_config();

        let job = build_job(&task, &config, 1).expect("job should build");
        let pod_spec = job.spec.unwrap().template.spec.unwrap();
        let agent = pod_spec
            .containers
            .iter()
            .find(|c| c.name == "agent")
            .unwrap();
        assert_eq!(agent.image.as_deref(), Some("ghcr.io/acme/runner:v1"));
    }

    #[test]
    fn build_job_sets_pod_failure_policy_for_oom_and_disruption() {
        let task = sample_task("task-a1b2c3d4");
        let config = sample_config();
        let job = build_job(&task, &config, 1).unwrap();
        let policy = job.spec.unwrap().pod_failure_policy.unwrap();

        let fail_on_137 = policy
            .rules
            .iter()
            .find(|r| r.on_exit_codes.is_some())
            .expect("an on-exit-codes rule");
        assert_eq!(fail_on_137.action, "FailJob");
        assert_eq!(
            fail_on_137.on_exit_codes.as_ref().unwrap().values,
            vec![137]
        );

        let ignore_disruption = policy
            .rules
            .iter()
            .find(|r| r.on_pod_conditions.is_some())
            .expect("an on-pod-conditions rule");
        assert_eq!(ignore_disruption.action, "Ignore");
        assert_eq!(
            ignore_disruption.on_pod_conditions.as_ref().unwrap()[0].type_,
            "DisruptionTarget"
        );
    }

    #[test]
    fn build_job_fails_on_missing_runner_image() {
        let task = sample_task("task-a1b2c3d4");
        let mut config = sample_config();
        config.allowed_runner_image = String::new();
        assert_eq!(
            build_job(&task, &config, 1).unwrap_err(),
            WorkloadError::MissingRunnerImage
        );
    }

    #[test]
    fn build_job_fails_on_invalid_app_id() {
        let task = sample_task("task-a1b2c3d4");
        let mut config = sample_config();
        config.app_id = 0;
        assert_eq!(
            build_job(&task, &config, 1).unwrap_err(),
            WorkloadError::InvalidAppId
        );
    }

    #[test]
    fn build_job_sets_owner_reference() {
        let task = sample_task("task-a1b2c3d4");
        let config = sample_config();
        let job = build_job(&task, &config, 1).unwrap();
        let owners = job.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "task-a1b2c3d4");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn classify_deadline_exceeded_job_condition() {
        let job = Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    reason: Some("DeadlineExceeded".to_string()),
                    message: Some("Job exceeded timeout".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(classify_job_failure(&job, &[]), FailureClass::TimedOut);
    }

    #[test]
    fn classify_oom_from_exit_code_137() {
        let job = Job::default();
        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "agent".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 137,
                            reason: Some("OOMKilled".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(classify_job_failure(&job, &[pod]), FailureClass::Oom);
    }

    #[test]
    fn classify_missing_pod_is_infrastructure() {
        let job = Job::default();
        assert!(matches!(
            classify_job_failure(&job, &[]),
            FailureClass::Infrastructure { .. }
        ));
    }

    #[test]
    fn classify_evicted_pod_is_infrastructure() {
        let job = Job::default();
        let pod = Pod {
            status: Some(PodStatus {
                reason: Some("Evicted".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            classify_job_failure(&job, &[pod]),
            FailureClass::Infrastructure { .. }
        ));
    }

    #[test]
    fn classify_generic_nonzero_exit_is_application() {
        let job = Job::default();
        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "agent".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 1,
                            reason: Some("Error".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            classify_job_failure(&job, &[pod]),
            FailureClass::Application { .. }
        ));
    }
}

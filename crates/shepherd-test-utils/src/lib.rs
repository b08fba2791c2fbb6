//! Shared test doubles for Shepherd crates.
//!
//! Provides an in-memory `TaskStore` that enforces the same
//! compare-and-swap semantics as `KubeTaskStore` against a `resourceVersion`
//! counter, plus builders for `Task` fixtures, so reconciler and handler
//! tests don't need a live cluster.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use shepherd_k8s::crd::TaskDetail;
use shepherd_k8s::label::ListFilter;
use shepherd_k8s::{
    CallbackSpec, ConditionStatus, ConditionType, RepoSpec, RunnerSpec, Task, TaskResult,
    TaskSpecInner, TaskStatus, TaskStore, TaskStoreError,
};

/// In-memory stand-in for `KubeTaskStore`. Each `create`/`update_status`
/// bumps a monotonic counter stored as the task's `resourceVersion`, so CAS
/// conflicts can be exercised the same way they'd occur against a real
/// apiserver.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<String, Task>>,
    next_version: Mutex<u64>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        let mut guard = self.next_version.lock().unwrap();
        *guard += 1;
        guard.to_string()
    }

    /// Seeds the store with a task, bypassing `create`'s `AlreadyExists`
    /// check. Useful for setting up reconciler test fixtures directly.
    pub fn seed(&self, mut task: Task) {
        let version = self.next_resource_version();
        task.meta_mut().resource_version = Some(version);
        self.tasks.lock().unwrap().insert(task.name_any(), task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, mut task: Task) -> Result<Task, TaskStoreError> {
        let name = task.name_any();
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&name) {
            return Err(TaskStoreError::AlreadyExists { name });
        }
        let version = self.next_resource_version();
        task.meta_mut().resource_version = Some(version);
        tasks.insert(name, task.clone());
        Ok(task)
    }

    async fn get(&self, name: &str) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.tasks.lock().unwrap().get(name).cloned())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Task>, TaskStoreError> {
        let all: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        let matches = |task: &Task| {
            let labels = task.labels();
            if let Some(repo) = &filter.repo {
                if labels.get("shepherd.sh/repo").map(String::as_str) != Some(repo.as_str()) {
                    return false;
                }
            }
            if let Some(issue) = &filter.issue {
                if labels.get("shepherd.sh/issue").map(String::as_str) != Some(issue.as_str()) {
                    return false;
                }
            }
            if let Some(fleet) = &filter.fleet {
                if labels.get("shepherd.sh/fleet").map(String::as_str) != Some(fleet.as_str()) {
                    return false;
                }
            }
            true
        };
        Ok(all.into_iter().filter(matches).collect())
    }

    async fn update_status(
        &self,
        name: &str,
        expected_resource_version: &str,
        status: TaskStatus,
    ) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| TaskStoreError::NotFound(name.to_string()))?;

        let actual_version = task.resource_version().unwrap_or_default();
        if actual_version != expected_resource_version {
            return Err(TaskStoreError::Conflict {
                name: name.to_string(),
                expected: expected_resource_version.to_string(),
                actual: actual_version,
            });
        }

        task.status = Some(status);
        let version = self.next_resource_version();
        task.meta_mut().resource_version = Some(version);
        Ok(task.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), TaskStoreError> {
        self.tasks.lock().unwrap().remove(name);
        Ok(())
    }
}

/// A minimal, valid `Task` fixture. Override fields on the returned value
/// as a given test needs.
pub fn sample_task(name: &str) -> Task {
    Task {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation: Some(1),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        spec: TaskSpecInner {
            repo: RepoSpec {
                url: "https://github.com/acme/widget.git".to_string(),
                git_ref: None,
            },
            task: TaskDetail {
                description: "Fix the login bug".to_string(),
                context: None,
                context_encoding: None,
                context_url: None,
                source_type: None,
                source_id: None,
            },
            callback: CallbackSpec {
                url: "https://adapter.example/callback".to_string(),
            },
            runner: RunnerSpec::default(),
        },
        status: Some(TaskStatus::default()),
    }
}

/// A `Task` fixture carrying a result and `Succeeded=True` condition, as if
/// the reconciler had already finished it.
pub fn succeeded_task(name: &str, pr_url: &str) -> Task {
    let mut task = sample_task(name);
    let mut status = TaskStatus::default();
    status.result = TaskResult {
        pr_url: Some(pr_url.to_string()),
        error: None,
    };
    status.set_condition(
        ConditionType::Succeeded,
        ConditionStatus::True,
        "Completed",
        "agent opened a pull request",
        1,
    );
    task.status = Some(status);
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = InMemoryTaskStore::new();
        let task = sample_task("task-abc123");
        store.create(task.clone()).await.unwrap();

        let fetched = store.get("task-abc123").await.unwrap().unwrap();
        assert_eq!(fetched.name_any(), "task-abc123");
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let store = InMemoryTaskStore::new();
        let task = sample_task("task-abc123");
        store.create(task.clone()).await.unwrap();

        let err = store.create(task).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_status_rejects_stale_version() {
        let store = InMemoryTaskStore::new();
        let task = store.create(sample_task("task-abc123")).await.unwrap();
        let stale_version = "0";
        let _ = &task;

        let err = store
            .update_status("task-abc123", stale_version, TaskStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_status_succeeds_with_current_version() {
        let store = InMemoryTaskStore::new();
        let task = store.create(sample_task("task-abc123")).await.unwrap();
        let version = task.resource_version().unwrap();

        let updated = store
            .update_status("task-abc123", &version, TaskStatus::default())
            .await
            .unwrap();
        assert_ne!(updated.resource_version().unwrap(), version);
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let store = InMemoryTaskStore::new();
        let mut task = sample_task("task-abc123");
        task.labels_mut()
            .insert("shepherd.sh/repo".to_string(), "acme/widget".to_string());
        store.create(task).await.unwrap();

        let filter = ListFilter {
            repo: Some("acme/widget".to_string()),
            ..Default::default()
        };
        let results = store.list(&filter).await.unwrap();
        assert_eq!(results.len(), 1);

        let filter = ListFilter {
            repo: Some("other/repo".to_string()),
            ..Default::default()
        };
        assert!(store.list(&filter).await.unwrap().is_empty());
    }
}

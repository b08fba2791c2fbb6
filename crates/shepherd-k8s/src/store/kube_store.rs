//! Production `TaskStore` backed by the real Kubernetes API.

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

use crate::crd::{Task, TaskStatus};
use crate::label::ListFilter;
use crate::store::{TaskStore, TaskStoreError};

/// Wraps `kube::Api<Task>`, scoped to a single namespace.
pub struct KubeTaskStore {
    api: Api<Task>,
}

impl KubeTaskStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn map_kube_error(err: kube::Error, name: &str) -> TaskStoreError {
        if let kube::Error::Api(resp) = &err {
            if resp.code == 404 {
                return TaskStoreError::NotFound(name.to_string());
            }
            if resp.code == 409 {
                return TaskStoreError::Conflict {
                    name: name.to_string(),
                    expected: String::new(),
                    actual: String::new(),
                };
            }
        }
        TaskStoreError::Backend(err.to_string())
    }
}

#[async_trait]
impl TaskStore for KubeTaskStore {
    async fn create(&self, task: Task) -> Result<Task, TaskStoreError> {
        let name = task.name_any();
        self.api
            .create(&PostParams::default(), &task)
            .await
            .map_err(|e| {
                if let kube::Error::Api(resp) = &e {
                    if resp.code == 409 {
                        return TaskStoreError::AlreadyExists { name: name.clone() };
                    }
                }
                Self::map_kube_error(e, &name)
            })
    }

    async fn get(&self, name: &str) -> Result<Option<Task>, TaskStoreError> {
        match self.api.get(name).await {
            Ok(task) => Ok(Some(task)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(Self::map_kube_error(e, name)),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Task>, TaskStoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = filter.label_selector() {
            params = params.labels(&selector);
        }
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| TaskStoreError::Backend(e.to_string()))?;
        Ok(list.items)
    }

    async fn update_status(
        &self,
        name: &str,
        expected_resource_version: &str,
        status: TaskStatus,
    ) -> Result<Task, TaskStoreError> {
        // `metadata.resourceVersion` in the patch body is a precondition the
        // apiserver itself enforces against the stored object, not just this
        // process's view of it -- a stale version is rejected with a real 409
        // rather than racing a GET-then-PATCH against any other writer.
        let patch = Patch::Merge(serde_json::json!({
            "metadata": { "resourceVersion": expected_resource_version },
            "status": status,
        }));
        self.api
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| {
                if let kube::Error::Api(resp) = &e {
                    if resp.code == 409 {
                        return TaskStoreError::Conflict {
                            name: name.to_string(),
                            expected: expected_resource_version.to_string(),
                            actual: String::new(),
                        };
                    }
                }
                Self::map_kube_error(e, name)
            })
    }

    async fn delete(&self, name: &str) -> Result<(), TaskStoreError> {
        match self.api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(TaskStoreError::Backend(e.to_string())),
        }
    }
}

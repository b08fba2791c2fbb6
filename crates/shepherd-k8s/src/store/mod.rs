//! The `TaskStore` abstraction over the cluster key-value store (§4.1, §9
//! "Global state").
//!
//! The reconciler, watcher, and API handlers depend on this trait rather
//! than on `kube::Api<Task>` directly, so tests can substitute an in-memory
//! fake that still enforces compare-and-swap semantics.

pub mod kube_store;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::{Task, TaskStatus};
use crate::label::ListFilter;

pub use kube_store::KubeTaskStore;

/// Errors the store can surface. Status-update conflicts are returned to the
/// caller, not retried inside this layer (§4.1).
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {name} already exists")]
    AlreadyExists { name: String },

    #[error("optimistic concurrency conflict on task {name}: expected resource version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("task store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a new task object. Fails with `AlreadyExists` if the name is
    /// taken (names are generated to make this vanishingly unlikely, but the
    /// caller must still handle it, see §4.3.1).
    async fn create(&self, task: Task) -> Result<Task, TaskStoreError>;

    /// Fetch a task by name, or `Ok(None)` if it doesn't exist.
    async fn get(&self, name: &str) -> Result<Option<Task>, TaskStoreError>;

    /// List tasks matching the selector portion of `filter`. The caller
    /// applies `filter.apply_active_filter` client-side.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Task>, TaskStoreError>;

    /// Replace `status` on the named task, guarded by compare-and-swap on
    /// `expected_resource_version`. Returns the updated task (with its new
    /// resource version) on success, or `Conflict` if another writer raced.
    async fn update_status(
        &self,
        name: &str,
        expected_resource_version: &str,
        status: TaskStatus,
    ) -> Result<Task, TaskStoreError>;

    /// Delete a task by name. A no-op (`Ok(())`) if already gone.
    async fn delete(&self, name: &str) -> Result<(), TaskStoreError>;
}

//! Kubernetes-facing types and storage for Shepherd tasks.
//!
//! This crate owns everything that touches the cluster API directly: the
//! `Task` custom resource definition, its condition machinery, the child
//! workload builder, and the `TaskStore` trait that the rest of the system
//! programs against instead of a concrete `kube::Api<Task>`.

pub mod client;
pub mod condition;
pub mod crd;
pub mod label;
pub mod leader;
pub mod store;
pub mod workload;

pub use condition::{Condition, ConditionStatus, ConditionType, FailedReason};
pub use crd::{
    CallbackSpec, RepoSpec, RunnerSpec, Task, TaskResult, TaskSpec, TaskSpecInner, TaskStatus,
};
pub use store::{TaskStore, TaskStoreError};
pub use workload::{build_job, classify_job_failure, job_name, FailureClass, OperatorConfig, WorkloadError};

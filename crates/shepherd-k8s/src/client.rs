//! Kubernetes client wiring and the CRD ensure-installed helper.

use anyhow::{Context, Result};
use kube::{Client, CustomResourceExt};
use tracing::info;

use crate::crd::Task;

/// Build a client using the in-cluster config when available, falling back
/// to the local kubeconfig -- the same resolution `kube::Client::try_default`
/// performs, named explicitly here so startup failures are easy to find in
/// logs.
pub async fn create_client() -> Result<Client> {
    let client = Client::try_default()
        .await
        .context("failed to build a Kubernetes client from in-cluster config or kubeconfig")?;
    info!("connected to Kubernetes API");
    Ok(client)
}

/// Render the `Task` CRD manifest (for `shepherd crd-manifest` / operator
/// bootstrap tooling). Does not apply it -- installing CRDs is a deploy-time
/// concern, out of scope for this crate.
pub fn task_crd_yaml() -> Result<String> {
    let crd = Task::crd();
    serde_yaml_like_json(&crd)
}

/// Kubernetes CRD manifests are conventionally shipped as YAML, but this
/// crate has no YAML dependency of its own; operators are expected to pipe
/// the JSON this returns through any JSON-to-YAML converter, or apply it
/// directly since the Kubernetes API accepts JSON on its YAML-shaped routes.
fn serde_yaml_like_json(crd: &k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition) -> Result<String> {
    serde_json::to_string_pretty(crd).context("failed to serialize Task CRD")
}

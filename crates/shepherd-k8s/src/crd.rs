//! The `Task` custom resource: immutable spec, controller/API-owned status.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// A task asking an AI coding agent to operate on a repository and produce
/// a pull request, reported back through `spec.callback.url`.
///
/// `repo` and `task` are meant to be immutable after creation (§6.5), but
/// that is not yet enforced: no `x-kubernetes-validations` rule is attached
/// to this schema, so nothing currently stops an update from changing
/// either field short of not sending one. `shepherd-server`'s `validate.rs`
/// only checks these fields at create time.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "shepherd.sh",
    version = "v1alpha1",
    kind = "Task",
    namespaced,
    status = "TaskStatus",
    shortname = "task",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpecInner {
    pub repo: RepoSpec,
    pub task: TaskDetail,
    pub callback: CallbackSpec,
    #[serde(default)]
    pub runner: RunnerSpec,
}

/// Alias kept for callers that want to spell out the generated spec type
/// without reaching into the `kube`-generated module path.
pub type TaskSpec = TaskSpecInner;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    /// Must match `^https://`.
    pub url: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    /// Non-empty.
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// `"" | "gzip"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackSpec {
    /// Must match `^https?://`; SSRF-blocked hosts are rejected at create time.
    pub url: String,
}

/// Runner hints from the task author. `image` is intentionally ignored by
/// the reconciler (§4.2.1) -- the enforced image always comes from operator
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// ISO-8601 duration string; defaults to 30 minutes when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<k8s_openapi::api::core::v1::ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_template_name: Option<String>,
}

impl RunnerSpec {
    pub const DEFAULT_TIMEOUT_SECS: i64 = 30 * 60;

    /// Parsed timeout, falling back to the 30-minute default.
    pub fn timeout_secs(&self) -> i64 {
        self.timeout
            .as_deref()
            .and_then(parse_duration_secs)
            .unwrap_or(Self::DEFAULT_TIMEOUT_SECS)
    }
}

/// Parses a subset of Go-style duration strings (`"5m"`, `"30s"`, `"1h30m"`)
/// sufficient for `runner.timeout`. Returns `None` on anything unrecognized.
fn parse_duration_secs(s: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return None,
        };
        total += n * unit;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// Observed state of a task, written only by the controller and the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_claim_name: Option<String>,
    #[serde(default)]
    pub result: TaskResult,
    /// One-shot flag for the credential issuer. Monotonic: once `true`,
    /// never reset to `false` within this task's lifetime.
    #[serde(default)]
    pub token_issued: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_thirty_minutes() {
        let runner = RunnerSpec::default();
        assert_eq!(runner.timeout_secs(), 1800);
    }

    #[test]
    fn parses_combined_duration() {
        let runner = RunnerSpec {
            timeout: Some("1h30m".to_string()),
            ..Default::default()
        };
        assert_eq!(runner.timeout_secs(), 3600 + 1800);
    }

    #[test]
    fn falls_back_on_unparseable_timeout() {
        let runner = RunnerSpec {
            timeout: Some("not-a-duration".to_string()),
            ..Default::default()
        };
        assert_eq!(runner.timeout_secs(), RunnerSpec::DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn task_status_default_has_no_conditions() {
        let status = TaskStatus::default();
        assert!(status.conditions.is_empty());
        assert!(!status.token_issued);
    }
}

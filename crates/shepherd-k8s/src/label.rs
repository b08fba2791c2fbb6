//! Label conventions used for task selection (§4.1, §4.3.2).

use crate::crd::Task;

pub const LABEL_REPO: &str = "shepherd.sh/repo";
pub const LABEL_ISSUE: &str = "shepherd.sh/issue";
pub const LABEL_FLEET: &str = "shepherd.sh/fleet";
pub const LABEL_SOURCE_TYPE: &str = "shepherd.sh/source-type";
pub const LABEL_SOURCE_ID: &str = "shepherd.sh/source-id";
pub const LABEL_TASK: &str = "shepherd.sh/task";

/// Selector fields accepted by the list endpoint, plus the client-side
/// `active` filter that excludes terminal tasks.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub repo: Option<String>,
    pub issue: Option<String>,
    pub fleet: Option<String>,
    pub active_only: bool,
}

impl ListFilter {
    /// Builds the Kubernetes label selector string for the server-side part
    /// of the filter (`repo`/`issue`/`fleet`). `active` is applied client-side
    /// because "not terminal" isn't expressible as an equality selector over
    /// a condition buried in `status`.
    pub fn label_selector(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(repo) = &self.repo {
            parts.push(format!("{LABEL_REPO}={}", sanitize(repo)));
        }
        if let Some(issue) = &self.issue {
            parts.push(format!("{LABEL_ISSUE}={}", sanitize(issue)));
        }
        if let Some(fleet) = &self.fleet {
            parts.push(format!("{LABEL_FLEET}={}", sanitize(fleet)));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        }
    }

    /// Client-side pass for the `active=true` filter: drops terminal tasks.
    pub fn apply_active_filter<'a>(&self, tasks: &'a [Task]) -> Vec<&'a Task> {
        tasks
            .iter()
            .filter(|t| !self.active_only || !t.status.is_terminal())
            .collect()
    }
}

/// Kubernetes label values must be alphanumeric, `-`, `_`, or `.`; replace
/// anything else so a malformed selector value can't smuggle extra clauses.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_has_no_selector() {
        let filter = ListFilter::default();
        assert_eq!(filter.label_selector(), None);
    }

    #[test]
    fn combines_selector_clauses() {
        let filter = ListFilter {
            repo: Some("acme/widget".to_string()),
            fleet: Some("nightly".to_string()),
            ..Default::default()
        };
        let selector = filter.label_selector().unwrap();
        assert!(selector.contains("shepherd.sh/repo=acme_widget"));
        assert!(selector.contains("shepherd.sh/fleet=nightly"));
    }

    #[test]
    fn sanitize_strips_unsafe_chars() {
        assert_eq!(sanitize("a/b c"), "a_b_c");
    }
}

//! Source-hosting credential issuance: one scoped token per task execution
//! (§4.3.6).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use shepherd_k8s::{Task, TaskStore, TaskStoreError};
use tracing::{instrument, warn};

use crate::error::TokenError;

/// Operator-level App configuration needed to mint and exchange tokens.
/// `None` when no source-hosting App is configured (§4.3.6 step 1, 503).
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub app_id: i64,
    pub installation_id: i64,
    pub api_url: String,
    pub private_key_pem: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Mints a short-lived RS256 JWT identifying the App itself (not the
/// installation). `iat` is backdated 60s for clock drift; `exp` is 10
/// minutes out, the maximum the source-hosting API accepts.
pub fn mint_app_jwt(creds: &AppCredentials) -> Result<String, TokenError> {
    let now = Utc::now();
    let claims = AppJwtClaims {
        iat: (now - ChronoDuration::seconds(60)).timestamp(),
        exp: (now + ChronoDuration::minutes(10)).timestamp(),
        iss: creds.app_id.to_string(),
    };
    let key = EncodingKey::from_rsa_pem(&creds.private_key_pem)
        .map_err(|e| TokenError::SigningFailed(e.to_string()))?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| TokenError::SigningFailed(e.to_string()))
}

/// Extracts `owner/repo` from a repository URL, tolerating a trailing
/// `.git` and `https://host/` prefix.
pub fn parse_owner_repo(repo_url: &str) -> Result<String, TokenError> {
    let trimmed = repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git");
    let path = trimmed
        .rsplit_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let mut segments = path.splitn(2, '/');
    let _host = segments.next();
    let owner_repo = segments
        .next()
        .ok_or_else(|| TokenError::InvalidFormat(repo_url.to_string()))?;
    if owner_repo.split('/').count() != 2 || owner_repo.contains("//") {
        return Err(TokenError::InvalidFormat(repo_url.to_string()));
    }
    Ok(owner_repo.to_string())
}

/// Exchanges an App JWT for an installation access token scoped to a single
/// repository.
#[instrument(skip(creds, http), fields(installation_id = creds.installation_id))]
pub async fn exchange_installation_token(
    creds: &AppCredentials,
    repo: &str,
    http: &reqwest::Client,
) -> Result<IssuedToken, TokenError> {
    let jwt = mint_app_jwt(creds)?;
    let url = format!(
        "{}/app/installations/{}/access_tokens",
        creds.api_url.trim_end_matches('/'),
        creds.installation_id
    );

    let response = http
        .post(&url)
        .bearer_auth(jwt)
        .json(&serde_json::json!({ "repository": repo }))
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| TokenError::ExchangeFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(TokenError::ExchangeFailed(format!(
            "installation token exchange returned {}",
            response.status()
        )));
    }

    let body: InstallationTokenResponse = response
        .json()
        .await
        .map_err(|e| TokenError::ExchangeFailed(e.to_string()))?;

    Ok(IssuedToken {
        token: body.token,
        expires_at: body.expires_at,
    })
}

/// Outcomes of the one-shot issuance flow the internal `/token` handler
/// maps onto HTTP status codes.
#[derive(Debug)]
pub enum IssueTokenOutcome {
    Issued(IssuedToken),
    NotFound,
    Terminal,
    NoAppConfigured,
    AlreadyIssued,
    /// CAS retries were exhausted while claiming `tokenIssued`.
    ClaimConflict,
    MintFailed(TokenError),
}

const MAX_CLAIM_RETRIES: u32 = 3;

/// Implements §4.3.6 end to end: load, check terminal/already-issued, claim
/// `tokenIssued` via compare-and-swap with bounded retry, then mint only
/// after the claim durably lands. A mint failure after the claim succeeds
/// is never retried within the execution -- see `MintFailed`.
#[instrument(skip(store, http, creds), fields(task_name))]
pub async fn issue_token(
    store: &dyn TaskStore,
    task_name: &str,
    creds: Option<&AppCredentials>,
    http: &reqwest::Client,
) -> IssueTokenOutcome {
    let Some(task) = store.get(task_name).await.unwrap_or(None) else {
        return IssueTokenOutcome::NotFound;
    };

    let status = task.status.clone().unwrap_or_default();
    if status.is_terminal() {
        return IssueTokenOutcome::Terminal;
    }
    if status.token_issued {
        return IssueTokenOutcome::AlreadyIssued;
    }
    let Some(creds) = creds else {
        return IssueTokenOutcome::NoAppConfigured;
    };
    let repo_url = task.spec.repo.url.clone();

    match claim_token_issued(store, task_name, task).await {
        Ok(ClaimResult::AlreadyIssued) => return IssueTokenOutcome::AlreadyIssued,
        Ok(ClaimResult::Claimed) => {}
        Err(()) => return IssueTokenOutcome::ClaimConflict,
    }

    let repo = match parse_owner_repo(&repo_url) {
        Ok(repo) => repo,
        Err(e) => return IssueTokenOutcome::MintFailed(e),
    };

    match exchange_installation_token(creds, &repo, http).await {
        Ok(token) => IssueTokenOutcome::Issued(token),
        Err(e) => {
            warn!(error = %e, "token mint failed after tokenIssued claim landed");
            IssueTokenOutcome::MintFailed(e)
        }
    }
}

enum ClaimResult {
    Claimed,
    AlreadyIssued,
}

async fn claim_token_issued(
    store: &dyn TaskStore,
    task_name: &str,
    mut task: Task,
) -> Result<ClaimResult, ()> {
    for _ in 0..MAX_CLAIM_RETRIES {
        let mut status = task.status.clone().unwrap_or_default();
        if status.token_issued {
            return Ok(ClaimResult::AlreadyIssued);
        }
        status.token_issued = true;

        let version = task.metadata.resource_version.clone().unwrap_or_default();
        match store.update_status(task_name, &version, status).await {
            Ok(updated) => {
                task = updated;
                return Ok(ClaimResult::Claimed);
            }
            Err(TaskStoreError::Conflict { .. }) => {
                match store.get(task_name).await {
                    Ok(Some(fresh)) => task = fresh,
                    _ => return Err(()),
                }
            }
            Err(_) => return Err(()),
        }
    }
    Err(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_owner_repo_from_https_url() {
        assert_eq!(
            parse_owner_repo("https://github.com/acme/widget.git").unwrap(),
            "acme/widget"
        );
    }

    #[test]
    fn parses_owner_repo_without_git_suffix() {
        assert_eq!(
            parse_owner_repo("https://github.com/acme/widget").unwrap(),
            "acme/widget"
        );
    }

    #[test]
    fn rejects_url_missing_repo_segment() {
        assert!(parse_owner_repo("https://github.com/acme").is_err());
    }

    #[tokio::test]
    async fn issue_token_not_found_when_task_missing() {
        let store = shepherd_test_utils::InMemoryTaskStore::new();
        let http = reqwest::Client::new();
        let outcome = issue_token(&store, "task-missing", None, &http).await;
        assert!(matches!(outcome, IssueTokenOutcome::NotFound));
    }

    #[tokio::test]
    async fn issue_token_no_app_configured() {
        let store = shepherd_test_utils::InMemoryTaskStore::new();
        let task = shepherd_test_utils::sample_task("task-abc123");
        store.create(task).await.unwrap();

        let http = reqwest::Client::new();
        let outcome = issue_token(&store, "task-abc123", None, &http).await;
        assert!(matches!(outcome, IssueTokenOutcome::NoAppConfigured));
    }

    #[tokio::test]
    async fn issue_token_terminal_task_is_rejected() {
        let store = shepherd_test_utils::InMemoryTaskStore::new();
        let task = shepherd_test_utils::succeeded_task("task-abc123", "https://example.com/pr/1");
        store.create(task).await.unwrap();

        let creds = AppCredentials {
            app_id: 1,
            installation_id: 2,
            api_url: "https://api.github.com".to_string(),
            private_key_pem: Vec::new(),
        };
        let http = reqwest::Client::new();
        let outcome = issue_token(&store, "task-abc123", Some(&creds), &http).await;
        assert!(matches!(outcome, IssueTokenOutcome::Terminal));
    }

    #[tokio::test]
    async fn issue_token_already_issued_is_rejected() {
        let store = shepherd_test_utils::InMemoryTaskStore::new();
        let mut task = shepherd_test_utils::sample_task("task-abc123");
        task.status.as_mut().unwrap().token_issued = true;
        store.create(task).await.unwrap();

        let creds = AppCredentials {
            app_id: 1,
            installation_id: 2,
            api_url: "https://api.github.com".to_string(),
            private_key_pem: Vec::new(),
        };
        let http = reqwest::Client::new();
        let outcome = issue_token(&store, "task-abc123", Some(&creds), &http).await;
        assert!(matches!(outcome, IssueTokenOutcome::AlreadyIssued));
    }
}

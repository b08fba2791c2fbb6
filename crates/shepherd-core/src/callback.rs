//! Outbound adapter callback: HMAC-signed HTTP POST (§4.4, §6.3).

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{instrument, warn};

use crate::error::CallbackError;

type HmacSha256 = Hmac<Sha256>;

/// `{taskId, event, message, details}`, the payload shape carried to the
/// adapter and, internally, in progress/terminal events from the agent.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub event: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CallbackDetails>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallbackDetails {
    #[serde(rename = "pr_url", skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Computes `X-Shepherd-Signature: sha256=<hex>` for a request body. An
/// empty secret means signing is disabled (dev only): the header is
/// omitted entirely rather than sent with a dummy value.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any size");
    mac.update(body);
    let hex_digest = hex::encode(mac.finalize().into_bytes());
    Some(format!("sha256={hex_digest}"))
}

/// Sends a signed callback to the adapter's URL. Body is drained on every
/// response so the underlying connection is returned to the pool.
pub struct CallbackSender {
    client: reqwest::Client,
    secret: Vec<u8>,
}

impl CallbackSender {
    pub fn new(secret: Vec<u8>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client should build with static config");
        Self { client, secret }
    }

    #[instrument(skip(self, payload), fields(task_id = %payload.task_id, event = %payload.event))]
    pub async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let body = serde_json::to_vec(payload).expect("CallbackPayload always serializes");

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(signature) = sign_body(&self.secret, &body) {
            request = request.header("X-Shepherd-Signature", signature);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        // Drain the body regardless of outcome so the connection is reusable.
        let _ = response.bytes().await;

        if !status.is_success() {
            warn!(%status, "adapter callback returned non-success status");
            return Err(CallbackError::NonSuccessStatus(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_omits_signature() {
        assert_eq!(sign_body(b"", b"{}"), None);
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign_body(b"secret", b"{\"a\":1}").unwrap();
        let b = sign_body(b"secret", b"{\"a\":1}").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
    }

    #[test]
    fn different_bodies_produce_different_signatures() {
        let a = sign_body(b"secret", b"{\"a\":1}").unwrap();
        let b = sign_body(b"secret", b"{\"a\":2}").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn send_success_drains_body_and_returns_ok() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sender = CallbackSender::new(b"secret".to_vec());
        let payload = CallbackPayload {
            task_id: "task-abc123".to_string(),
            event: "completed".to_string(),
            message: "done".to_string(),
            details: Some(CallbackDetails {
                pr_url: Some("https://github.com/acme/widget/pull/7".to_string()),
                error: None,
            }),
        };

        sender.send(&server.uri(), &payload).await.unwrap();
    }

    #[tokio::test]
    async fn send_non_success_status_is_an_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender = CallbackSender::new(b"secret".to_vec());
        let payload = CallbackPayload {
            task_id: "task-abc123".to_string(),
            event: "failed".to_string(),
            message: "boom".to_string(),
            details: None,
        };

        let err = sender.send(&server.uri(), &payload).await.unwrap_err();
        assert!(matches!(err, CallbackError::NonSuccessStatus(_)));
    }
}

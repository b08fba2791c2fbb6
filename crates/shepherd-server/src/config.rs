//! Operator-level configuration for shepherd (§1.1, §6.6).
//!
//! A single `ShepherdConfig`, populated by `clap::Parser` with environment
//! fallback on every flag. Construction fails fast so misconfiguration is
//! caught before the controller or API starts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use shepherd_core::AppCredentials;
use shepherd_k8s::OperatorConfig;

#[derive(Parser, Debug)]
#[command(name = "shepherd", about = "Cluster-native orchestrator for AI coding agent tasks")]
pub struct ShepherdConfig {
    /// Namespace the controller and API operate in.
    #[arg(long, env = "SHEPHERD_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Container image enforced for every runner pod, regardless of
    /// `spec.runner.image` (§4.2.1).
    #[arg(long, env = "SHEPHERD_RUNNER_IMAGE")]
    pub runner_image: String,

    /// Init container image that materializes task data into `/task`.
    #[arg(long, env = "SHEPHERD_INIT_IMAGE")]
    pub init_image: String,

    /// Name of the Secret mounted into runner pods.
    #[arg(long, env = "SHEPHERD_RUNNER_SECRET_NAME")]
    pub runner_secret_name: String,

    /// Source-hosting App ID. Omit (or leave 0) to run without a configured
    /// App; token issuance then returns 503 (§4.3.6 step 1).
    #[arg(long, env = "APP_ID", default_value_t = 0)]
    pub app_id: i64,

    /// Source-hosting App installation ID.
    #[arg(long, env = "INSTALLATION_ID", default_value_t = 0)]
    pub installation_id: i64,

    /// Base URL of the source-hosting API (e.g. `https://api.github.com`).
    #[arg(long, env = "API_URL", default_value = "https://api.github.com")]
    pub api_url: String,

    /// Path to the App's RS256 private key in PEM form.
    #[arg(long, env = "APP_PRIVATE_KEY_PATH")]
    pub app_private_key_path: Option<PathBuf>,

    /// Base URL the internal API is reachable at from inside the cluster,
    /// passed to runner pods as an environment variable.
    #[arg(long, env = "SHEPHERD_INTERNAL_API_BASE_URL")]
    pub internal_api_base_url: String,

    /// Bind address for the public listener (tasks, event stream).
    #[arg(long, env = "SHEPHERD_PUBLIC_ADDR", default_value = "0.0.0.0:8080")]
    pub public_addr: String,

    /// Bind address for the internal listener (agent-only traffic).
    #[arg(long, env = "SHEPHERD_INTERNAL_ADDR", default_value = "0.0.0.0:8081")]
    pub internal_addr: String,

    /// Shared secret for HMAC-signing outbound callbacks. Empty omits the
    /// signature header entirely -- development only.
    #[arg(long, env = "SHEPHERD_CALLBACK_SECRET", default_value = "")]
    pub callback_secret: String,

    /// Enable leader election so only one replica runs the controller and
    /// watcher.
    #[arg(long, env = "SHEPHERD_LEADER_ELECTION", default_value_t = false)]
    pub leader_election: bool,

    /// Lock resource name used for leader election.
    #[arg(long, env = "SHEPHERD_LEADER_ELECTION_LOCK_NAME", default_value = "shepherd-controller")]
    pub leader_election_lock_name: String,
}

impl ShepherdConfig {
    /// Parses CLI flags with environment fallback, then validates the
    /// combination actually makes sense to start serving on.
    pub fn from_args_and_env() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.runner_image.trim().is_empty() {
            anyhow::bail!("--runner-image (SHEPHERD_RUNNER_IMAGE) must not be empty");
        }
        if self.init_image.trim().is_empty() {
            anyhow::bail!("--init-image (SHEPHERD_INIT_IMAGE) must not be empty");
        }
        if self.runner_secret_name.trim().is_empty() {
            anyhow::bail!("--runner-secret-name (SHEPHERD_RUNNER_SECRET_NAME) must not be empty");
        }
        if self.internal_api_base_url.trim().is_empty() {
            anyhow::bail!(
                "--internal-api-base-url (SHEPHERD_INTERNAL_API_BASE_URL) must not be empty"
            );
        }
        Ok(())
    }

    /// Projects the operator-global fields `shepherd_k8s::workload::build_job`
    /// needs out of the full config.
    pub fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            allowed_runner_image: self.runner_image.clone(),
            init_image: self.init_image.clone(),
            runner_secret_name: self.runner_secret_name.clone(),
            app_id: self.app_id,
            installation_id: self.installation_id,
            api_url: self.api_url.clone(),
            internal_api_base_url: self.internal_api_base_url.clone(),
        }
    }

    /// Loads the App's private key and builds `AppCredentials`, or `None` if
    /// no App is configured (`app_id <= 0` or no key path given) -- the
    /// token endpoint then answers 503 rather than failing startup.
    pub fn app_credentials(&self) -> Result<Option<AppCredentials>> {
        if self.app_id <= 0 || self.installation_id <= 0 {
            return Ok(None);
        }
        let Some(path) = &self.app_private_key_path else {
            return Ok(None);
        };
        let private_key_pem = std::fs::read(path)
            .with_context(|| format!("failed to read App private key at {}", path.display()))?;
        Ok(Some(AppCredentials {
            app_id: self.app_id,
            installation_id: self.installation_id,
            api_url: self.api_url.clone(),
            private_key_pem,
        }))
    }

    /// Raw HMAC secret bytes for the callback sender. Empty string yields an
    /// empty secret, which `shepherd_core::callback::sign_body` treats as
    /// "omit the signature header" (dev only).
    pub fn callback_secret_bytes(&self) -> Vec<u8> {
        self.callback_secret.clone().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "shepherd",
            "--runner-image",
            "ghcr.io/acme/runner:latest",
            "--init-image",
            "ghcr.io/acme/init:latest",
            "--runner-secret-name",
            "shepherd-runner-secret",
            "--internal-api-base-url",
            "http://shepherd-internal.shepherd.svc:8081",
        ]
    }

    #[test]
    fn parses_minimal_required_flags() {
        let config = ShepherdConfig::try_parse_from(base_args()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.public_addr, "0.0.0.0:8080");
    }

    #[test]
    fn rejects_empty_runner_image() {
        let mut args = base_args();
        let idx = args.iter().position(|a| *a == "--runner-image").unwrap();
        args[idx + 1] = "";
        let config = ShepherdConfig::try_parse_from(args).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn no_app_configured_yields_none_credentials() {
        let config = ShepherdConfig::try_parse_from(base_args()).unwrap();
        assert!(config.app_credentials().unwrap().is_none());
    }

    #[test]
    fn empty_callback_secret_is_empty_bytes() {
        let config = ShepherdConfig::try_parse_from(base_args()).unwrap();
        assert!(config.callback_secret_bytes().is_empty());
    }
}

//! Subsystem error enums for the parts of the core that aren't HTTP-facing
//! (§7.1). `ApiError`, which wraps these for the axum surface, lives in
//! `shepherd-server` since this crate takes no dependency on axum.

use shepherd_k8s::TaskStoreError;
use thiserror::Error;

/// Errors surfaced by the reconciliation controller, consumed by
/// `kube::runtime::Controller`'s `on_error`.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error("workload could not be built: {0}")]
    WorkloadBuild(String),
}

/// Errors from minting and exchanging source-hosting credentials (§4.3.6).
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid repository reference: {0}")]
    InvalidFormat(String),

    #[error("failed to sign JWT: {0}")]
    SigningFailed(String),

    #[error("token exchange with source-hosting API failed: {0}")]
    ExchangeFailed(String),

    #[error("a token has already been issued for this task execution")]
    AlreadyIssued,
}

/// Errors from the outbound callback sender (§4.4). Never bubbles as a 5xx
/// to the caller of the status endpoint; it is classified into the
/// `Notified` condition's reason instead.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to send callback: {0}")]
    SendFailed(#[from] reqwest::Error),

    #[error("callback endpoint returned non-success status {0}")]
    NonSuccessStatus(reqwest::StatusCode),
}

//! Shared application state for both the public and internal routers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shepherd_core::{AppCredentials, CallbackSender, EventHub};
use shepherd_k8s::TaskStore;

/// Cloned into every handler via `axum::extract::State`. Cheap to clone: it
/// is a bundle of `Arc`s and atomics.
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn TaskStore>,
    pub events: Arc<EventHub>,
    pub callback: Arc<CallbackSender>,
    pub http: reqwest::Client,
    pub app_credentials: Option<Arc<AppCredentials>>,
    pub namespace: String,
    pub context_compression_threshold_bytes: usize,
    /// Flipped once the informer cache has synced; `/readyz` depends on it.
    pub cache_synced: Arc<AtomicBool>,
    /// Flipped by the watcher's run loop on each successful pass; `/readyz`
    /// depends on it staying true.
    pub watcher_healthy: Arc<AtomicBool>,
}

impl ServerState {
    pub fn is_ready(&self) -> bool {
        self.cache_synced.load(Ordering::Relaxed) && self.watcher_healthy.load(Ordering::Relaxed)
    }
}

/// Context larger than this is rejected with 413 after compression (§4.3.1,
/// §9 open question -- 1.4 MB compressed is the documented default).
pub const DEFAULT_CONTEXT_COMPRESSION_THRESHOLD_BYTES: usize = 1_400_000;

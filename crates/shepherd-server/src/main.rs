mod config;
mod error;
mod routes;
mod state;
mod validate;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use shepherd_core::{CallbackSender, EventHub, ReconcilerContext, Watcher};
use shepherd_k8s::store::KubeTaskStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::ShepherdConfig;
use state::ServerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ShepherdConfig::from_args_and_env()?;
    info!(namespace = %config.namespace, "starting shepherd");

    let client = shepherd_k8s::client::create_client().await?;
    let operator_config = config.operator_config();
    let app_credentials = config.app_credentials()?.map(Arc::new);

    let store: Arc<dyn shepherd_k8s::TaskStore> =
        Arc::new(KubeTaskStore::new(client.clone(), &config.namespace));
    let events = Arc::new(EventHub::new());
    let callback = Arc::new(CallbackSender::new(config.callback_secret_bytes()));
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build the shared HTTP client")?;

    let cache_synced = Arc::new(AtomicBool::new(false));
    let watcher_healthy = Arc::new(AtomicBool::new(false));

    let server_state = ServerState {
        store: store.clone(),
        events: events.clone(),
        callback: callback.clone(),
        http: http.clone(),
        app_credentials,
        namespace: config.namespace.clone(),
        context_compression_threshold_bytes: state::DEFAULT_CONTEXT_COMPRESSION_THRESHOLD_BYTES,
        cache_synced: cache_synced.clone(),
        watcher_healthy: watcher_healthy.clone(),
    };

    let shutdown = CancellationToken::new();
    let identity = pod_identity();

    let leader_token = if config.leader_election {
        info!(lock_name = %config.leader_election_lock_name, "waiting to acquire leader lease");
        shepherd_k8s::leader::acquire_and_hold(
            client.clone(),
            &config.namespace,
            &config.leader_election_lock_name,
            &identity,
        )
        .await
    } else {
        shepherd_k8s::leader::always_leader()
    };

    let controller_handle = tokio::spawn(run_controller(
        client.clone(),
        store.clone(),
        operator_config,
        config.namespace.clone(),
        cache_synced.clone(),
        leader_token.clone(),
        shutdown.clone(),
    ));

    let watcher_handle = tokio::spawn(run_status_watcher(
        client.clone(),
        store.clone(),
        callback.clone(),
        events.clone(),
        config.namespace.clone(),
        watcher_healthy.clone(),
        leader_token.clone(),
        shutdown.clone(),
    ));

    let public_listener = tokio::net::TcpListener::bind(config.public_addr.as_str())
        .await
        .with_context(|| format!("failed to bind public listener on {}", config.public_addr))?;
    let internal_listener = tokio::net::TcpListener::bind(config.internal_addr.as_str())
        .await
        .with_context(|| format!("failed to bind internal listener on {}", config.internal_addr))?;

    info!(addr = %config.public_addr, "public API listening");
    info!(addr = %config.internal_addr, "internal API listening");

    let public_app = routes::public_router(server_state.clone());
    let internal_app = routes::internal_router(server_state);

    let public_shutdown = shutdown.clone();
    let internal_shutdown = shutdown.clone();
    let public_server = tokio::spawn(async move {
        axum::serve(public_listener, public_app)
            .with_graceful_shutdown(public_shutdown.cancelled_owned())
            .await
    });
    let internal_server = tokio::spawn(async move {
        axum::serve(internal_listener, internal_app)
            .with_graceful_shutdown(internal_shutdown.cancelled_owned())
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        _ = leader_token.cancelled() => {
            warn!("lost leader lease, shutting down");
        }
    }
    shutdown.cancel();

    let _ = public_server.await;
    let _ = internal_server.await;
    controller_handle.abort();
    watcher_handle.abort();

    info!("shepherd shut down");
    Ok(())
}

fn pod_identity() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| format!("shepherd-{}", std::process::id()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Drives `shepherd_core::reconcile` over every `Task` in the namespace,
/// owning the Jobs it creates so a Job status change requeues its task
/// (§4.2).
async fn run_controller(
    client: kube::Client,
    store: Arc<dyn shepherd_k8s::TaskStore>,
    operator_config: shepherd_k8s::OperatorConfig,
    namespace: String,
    cache_synced: Arc<AtomicBool>,
    leader_token: CancellationToken,
    shutdown: CancellationToken,
) {
    use futures::StreamExt;
    use kube::runtime::controller::Controller;
    use kube::runtime::events::Reporter;
    use kube::Api;

    let tasks: Api<shepherd_k8s::Task> = Api::namespaced(client.clone(), &namespace);
    let jobs: Api<k8s_openapi::api::batch::v1::Job> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), &namespace);

    let ctx = Arc::new(ReconcilerContext {
        store,
        jobs: jobs.clone(),
        pods,
        config: operator_config,
        client: client.clone(),
        reporter: Reporter::from("shepherd-controller".to_string()),
    });

    let mut controller = Controller::new(tasks, Default::default())
        .owns(jobs, Default::default())
        .shutdown_on_signal()
        .run(shepherd_core::reconcile, shepherd_core::error_policy, ctx)
        .boxed();

    cache_synced.store(true, Ordering::Relaxed);
    info!("controller cache synced");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = leader_token.cancelled() => return,
            next = controller.next() => {
                match next {
                    Some(Ok((task_ref, action))) => {
                        tracing::debug!(?task_ref, ?action, "reconciled");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "reconcile error");
                    }
                    None => return,
                }
            }
        }
    }
}

/// Streams `Task` updates and hands each to `shepherd_core::Watcher`, which
/// races the agent-driven status handler over the terminal callback (§4.5).
async fn run_status_watcher(
    client: kube::Client,
    store: Arc<dyn shepherd_k8s::TaskStore>,
    callback: Arc<CallbackSender>,
    events: Arc<EventHub>,
    namespace: String,
    watcher_healthy: Arc<AtomicBool>,
    leader_token: CancellationToken,
    shutdown: CancellationToken,
) {
    use futures::StreamExt;
    use kube::runtime::{watcher, WatchStreamExt};
    use kube::Api;

    let tasks: Api<shepherd_k8s::Task> = Api::namespaced(client, &namespace);
    let status_watcher = Watcher::new(store, callback, events);

    let mut stream = watcher(tasks, watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .boxed();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = leader_token.cancelled() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(task)) => {
                        watcher_healthy.store(true, Ordering::Relaxed);
                        status_watcher.on_update(&task, &task).await;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "status watcher stream error");
                        watcher_healthy.store(false, Ordering::Relaxed);
                    }
                    None => return,
                }
            }
        }
    }
}

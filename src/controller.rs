use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::signal;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crd::{AuditSource, PHASE_DEGRADED, PHASE_RUNNING};
use crate::election::LeaderElector;
use crate::metrics;
use crate::pipeline::{self, SHUTDOWN_GRACE};

const FINALIZER: &str = "rbacwatch.io/cleanup";
const ERROR_REQUEUE: Duration = Duration::from_secs(60);
const FIELD_MANAGER: &str = "kube-rbac-watch";
const STARTUP_DELAY_CAP: Duration = Duration::from_secs(60);

/* ============================= CONFIG ============================= */

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub metrics_addr: String,
    pub health_addr: String,
    pub leader_elect: bool,
    pub lease_namespace: String,
    pub lease_name: String,
    pub concurrent_flushes: usize,
    pub requeue_seconds: u64,
    pub startup_retries: u32,
}

/* ============================= STATE ============================= */

pub(crate) struct OperatorState {
    pub(crate) ready: bool,
}

struct PipelineHandle {
    generation: i64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct ReconcileContext {
    client: Client,
    pipelines: Mutex<HashMap<String, PipelineHandle>>,
    root_cancel: CancellationToken,
    flush_semaphore: Arc<Semaphore>,
    requeue: Duration,
}

/* ============================= STARTUP RETRY ============================= */

/// Exponential backoff delays for manager startup: 1s, 2s, 4s, ... capped
/// at 60s per attempt.
pub fn backoff_delays(attempts: u32) -> Vec<Duration> {
    (0..attempts)
        .map(|n| Duration::from_secs(1u64 << n.min(6)).min(STARTUP_DELAY_CAP))
        .collect()
}

async fn connect_with_retry(attempts: u32) -> Result<Client> {
    let mut last_error = None;
    for (attempt, delay) in backoff_delays(attempts.max(1)).into_iter().enumerate() {
        match Client::try_default().await {
            Ok(client) => match client.apiserver_version().await {
                Ok(version) => {
                    info!(major = %version.major, minor = %version.minor, "cluster_reachable");
                    return Ok(client);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "cluster_unreachable_retrying");
                    last_error = Some(anyhow::Error::from(e));
                }
            },
            Err(e) => {
                warn!(attempt, error = %e, "kubeconfig_load_failed_retrying");
                last_error = Some(anyhow::Error::from(e));
            }
        }
        tokio::time::sleep(delay).await;
    }
    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no attempts made"))
        .context("startup retry budget exhausted"))
}

/* ============================= ENTRY ============================= */

pub async fn run(cfg: OperatorConfig) -> Result<()> {
    println!("Starting kube-rbac-watch operator...\n");
    metrics::force_init();

    let client = connect_with_retry(cfg.startup_retries).await?;

    let root_cancel = CancellationToken::new();

    if cfg.leader_elect {
        print!("  Leader election ............. ");
        let elector = LeaderElector::new(client.clone(), &cfg.lease_namespace, &cfg.lease_name);
        let lost = elector.acquire(root_cancel.clone()).await?;
        println!("acquired ({}/{})", cfg.lease_namespace, cfg.lease_name);
        let shutdown = root_cancel.clone();
        tokio::spawn(async move {
            lost.cancelled().await;
            warn!("leadership_lost_shutting_down");
            shutdown.cancel();
        });
    }

    let metrics_addr: SocketAddr = cfg
        .metrics_addr
        .parse()
        .context("invalid metrics bind address")?;
    let health_addr: SocketAddr = cfg
        .health_addr
        .parse()
        .context("invalid health bind address")?;

    println!("  CRD watch ................... AuditSource.rbacwatch.io/v1alpha1");
    println!("  Requeue interval ............ {}s", cfg.requeue_seconds);
    println!("  Metrics server .............. http://{metrics_addr}");
    if health_addr != metrics_addr {
        println!("  Health server ............... http://{health_addr}");
    }
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first reconcile)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_started");

    let state = Arc::new(Mutex::new(OperatorState { ready: false }));

    let http_handle = tokio::spawn(serve_http(
        build_operator_router(state.clone()),
        metrics_addr,
        root_cancel.clone(),
    ));
    let probe_handle = if health_addr != metrics_addr {
        Some(tokio::spawn(serve_http(
            build_probe_router(state.clone()),
            health_addr,
            root_cancel.clone(),
        )))
    } else {
        None
    };

    let ctx = Arc::new(ReconcileContext {
        client: client.clone(),
        pipelines: Mutex::new(HashMap::new()),
        root_cancel: root_cancel.clone(),
        flush_semaphore: Arc::new(Semaphore::new(cfg.concurrent_flushes.max(1))),
        requeue: Duration::from_secs(cfg.requeue_seconds.max(10)),
    });

    let sources: Api<AuditSource> = Api::all(client.clone());
    let controller_state = state.clone();
    let controller = Controller::new(sources, watcher::Config::default())
        .run(reconcile, error_policy, ctx.clone())
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "reconcile_dispatch_error");
                }
            }
        });

    tokio::select! {
        _ = controller => {
            info!("controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
        _ = root_cancel.cancelled() => {
            info!("shutdown_requested");
        }
    }

    root_cancel.cancel();
    stop_all_pipelines(&ctx).await;

    let _ = http_handle.await;
    if let Some(probe_handle) = probe_handle {
        let _ = probe_handle.await;
    }

    info!("operator_stopped");
    println!("Operator stopped.");
    Ok(())
}

/// Cancel every pipeline in parallel and wait out the shutdown grace.
async fn stop_all_pipelines(ctx: &ReconcileContext) {
    let handles: Vec<(String, PipelineHandle)> =
        ctx.pipelines.lock().await.drain().collect();
    let joins = handles.into_iter().map(|(key, handle)| async move {
        handle.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE * 2, handle.join).await.is_err() {
            warn!(source = %key, "pipeline_shutdown_deadline_exceeded");
        }
    });
    futures::future::join_all(joins).await;
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    source: Arc<AuditSource>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, kube::Error> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();
    let key = source
        .metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("{namespace}/{name}"));
    let generation = source.metadata.generation.unwrap_or_default();

    if source.metadata.deletion_timestamp.is_some() {
        info!(source = %name, namespace = %namespace, "source_deleted_stopping_pipeline");
        stop_pipeline(&ctx, &key).await;
        if has_finalizer(&source) {
            remove_finalizer(&source, &ctx.client).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&source) {
        add_finalizer(&source, &ctx.client).await?;
    }

    {
        let mut pipelines = ctx.pipelines.lock().await;
        if let Some(handle) = pipelines.get(&key) {
            if handle.generation == generation && !handle.join.is_finished() {
                return Ok(Action::requeue(ctx.requeue));
            }
            info!(
                source = %name,
                old_generation = handle.generation,
                new_generation = generation,
                "source_changed_restarting_pipeline"
            );
            if let Some(old) = pipelines.remove(&key) {
                old.cancel.cancel();
            }
        }

        let cancel = ctx.root_cancel.child_token();
        let join = tokio::spawn(run_pipeline_supervised(
            ctx.client.clone(),
            source.clone(),
            cancel.clone(),
            ctx.flush_semaphore.clone(),
        ));
        pipelines.insert(
            key,
            PipelineHandle {
                generation,
                cancel,
                join,
            },
        );
    }

    patch_phase(&ctx.client, &source, PHASE_RUNNING, None).await;
    info!(source = %name, namespace = %namespace, generation, "pipeline_scheduled");
    Ok(Action::requeue(ctx.requeue))
}

async fn stop_pipeline(ctx: &ReconcileContext, key: &str) {
    if let Some(handle) = ctx.pipelines.lock().await.remove(key) {
        handle.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE * 2, handle.join).await.is_err() {
            warn!(source = %key, "pipeline_shutdown_deadline_exceeded");
        }
    }
}

async fn run_pipeline_supervised(
    client: Client,
    source: Arc<AuditSource>,
    cancel: CancellationToken,
    flush_semaphore: Arc<Semaphore>,
) {
    let name = source.name_any();
    match pipeline::run_pipeline(client.clone(), source.clone(), cancel, flush_semaphore).await {
        Ok(()) => info!(source = %name, "pipeline_exited"),
        Err(e) => {
            // A pipeline failure never touches other pipelines; it is
            // surfaced on this source's status.
            error!(source = %name, error = %e, "pipeline_failed");
            patch_phase(&client, &source, PHASE_DEGRADED, Some(&e.to_string())).await;
        }
    }
}

fn error_policy(
    _source: Arc<AuditSource>,
    error: &kube::Error,
    _ctx: Arc<ReconcileContext>,
) -> Action {
    warn!(error = %error, "reconcile_error");
    Action::requeue(ERROR_REQUEUE)
}

async fn patch_phase(client: &Client, source: &AuditSource, phase: &str, message: Option<&str>) {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<AuditSource> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({
        "status": {
            "phase": phase,
            "message": message,
            "observedGeneration": source.metadata.generation,
        }
    });
    if let Err(e) = api
        .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        warn!(source = %name, error = %e, "status_phase_patch_failed");
    }
}

/* ============================= FINALIZER ============================= */

fn has_finalizer(source: &AuditSource) -> bool {
    source
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(
    source: &AuditSource,
    client: &Client,
) -> std::result::Result<(), kube::Error> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();
    let api: Api<AuditSource> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({
        "metadata": { "finalizers": [FINALIZER] }
    });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(source = %name, "finalizer_added");
    Ok(())
}

async fn remove_finalizer(
    source: &AuditSource,
    client: &Client,
) -> std::result::Result<(), kube::Error> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();
    let api: Api<AuditSource> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({
        "metadata": { "finalizers": [] }
    });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(source = %name, "finalizer_removed");
    Ok(())
}

/* ============================= HTTP ============================= */

pub(crate) fn build_operator_router(state: Arc<Mutex<OperatorState>>) -> Router {
    build_probe_router(state).route("/metrics", get(metrics_handler))
}

pub(crate) fn build_probe_router(state: Arc<Mutex<OperatorState>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn serve_http(app: Router, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "http_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn ready_handler(state: Arc<Mutex<OperatorState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */

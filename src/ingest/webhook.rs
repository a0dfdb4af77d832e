use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use lru::LruCache;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::WebhookConfig;
use crate::event::{AuditEvent, EventList};
use crate::ingest::{IngestError, Ingestor, Position};
use crate::metrics;

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 100;
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 << 20;

/// Audit IDs remembered to absorb apiserver retries.
const DEDUP_CAPACITY: usize = 4096;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/* ============================= STATE ============================= */

pub(crate) struct ReceiverState {
    tx: mpsc::Sender<AuditEvent>,
    limiter: Option<DefaultDirectRateLimiter>,
    dedup: Mutex<LruCache<String, ()>>,
    source: String,
}

impl ReceiverState {
    pub(crate) fn new(
        tx: mpsc::Sender<AuditEvent>,
        rate_limit_per_second: u32,
        source: &str,
    ) -> Self {
        let limiter = NonZeroU32::new(rate_limit_per_second)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        ReceiverState {
            tx,
            limiter,
            dedup: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(DEDUP_CAPACITY).expect("capacity is non-zero"),
            )),
            source: source.to_string(),
        }
    }

    /// True exactly once per audit ID within the LRU window.
    fn first_sighting(&self, audit_id: &str) -> bool {
        if audit_id.is_empty() {
            return true;
        }
        let mut dedup = self.dedup.lock().expect("dedup lock poisoned");
        dedup.put(audit_id.to_string(), ()).is_none()
    }
}

/* ============================= ROUTER ============================= */

pub(crate) fn build_router(state: Arc<ReceiverState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/audit", post(receive_handler))
        .route("/", post(receive_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn receive_handler(
    State(state): State<Arc<ReceiverState>>,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(limiter) = &state.limiter
        && limiter.check().is_err()
    {
        metrics::WEBHOOK_REQUESTS
            .with_label_values(&[&state.source, "429"])
            .inc();
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    }

    let envelope: EventList = match serde_json::from_slice(&body) {
        Ok(list) => list,
        Err(e) => {
            metrics::WEBHOOK_REQUESTS
                .with_label_values(&[&state.source, "400"])
                .inc();
            metrics::PARSE_ERRORS.with_label_values(&[&state.source]).inc();
            debug!(source = %state.source, error = %e, "webhook_envelope_malformed");
            return (StatusCode::BAD_REQUEST, "malformed audit envelope");
        }
    };

    // Events within one request stay in order; duplicates across apiserver
    // retries are absorbed silently.
    for event in envelope.items {
        if !state.first_sighting(&event.audit_id) {
            metrics::WEBHOOK_DEDUP_DROPPED
                .with_label_values(&[&state.source])
                .inc();
            continue;
        }
        if state.tx.send(event).await.is_err() {
            metrics::WEBHOOK_REQUESTS
                .with_label_values(&[&state.source, "503"])
                .inc();
            return (StatusCode::SERVICE_UNAVAILABLE, "pipeline shutting down");
        }
    }

    metrics::WEBHOOK_REQUESTS
        .with_label_values(&[&state.source, "200"])
        .inc();
    (StatusCode::OK, "accepted")
}

/* ============================= TLS ============================= */

#[derive(Debug)]
struct TlsMaterial {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    client_ca_pem: Option<Vec<u8>>,
}

async fn secret_value(
    client: &Client,
    namespace: &str,
    secret_name: &str,
    key: &str,
) -> Result<Vec<u8>, IngestError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets
        .get(secret_name)
        .await
        .map_err(|e| IngestError::Transport(e.into()))?;
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .ok_or_else(|| {
            IngestError::Config(format!("secret {namespace}/{secret_name} has no key {key:?}"))
        })
}

async fn load_tls_material(
    cfg: &WebhookConfig,
    client: Option<&Client>,
    namespace: &str,
) -> Result<TlsMaterial, IngestError> {
    let (cert_pem, key_pem) = if let (Some(cert), Some(key)) = (&cfg.tls_cert_path, &cfg.tls_key_path)
    {
        let cert = tokio::fs::read(cert).await.map_err(|e| {
            IngestError::Config(format!("cannot read TLS certificate {cert}: {e}"))
        })?;
        let key = tokio::fs::read(key)
            .await
            .map_err(|e| IngestError::Config(format!("cannot read TLS key {key}: {e}")))?;
        (cert, key)
    } else if let (Some(secret_name), Some(client)) = (&cfg.tls_secret_name, client) {
        let cert = secret_value(client, namespace, secret_name, "tls.crt").await?;
        let key = secret_value(client, namespace, secret_name, "tls.key").await?;
        (cert, key)
    } else {
        return Err(IngestError::Config(
            "webhook TLS is mandatory: set tlsSecretName or tlsCertPath/tlsKeyPath".to_string(),
        ));
    };

    let client_ca_pem = if let Some(path) = &cfg.client_ca_path {
        Some(tokio::fs::read(path).await.map_err(|e| {
            IngestError::Config(format!("cannot read client CA bundle {path}: {e}"))
        })?)
    } else if let (Some(secret_name), Some(client)) = (&cfg.client_ca_secret_name, client) {
        Some(secret_value(client, namespace, secret_name, "ca.crt").await?)
    } else {
        None
    };

    Ok(TlsMaterial {
        cert_pem,
        key_pem,
        client_ca_pem,
    })
}

/// Assemble the rustls server config; a client CA bundle switches on
/// client-certificate verification, so an mTLS failure is rejected at the
/// handshake before any request is read.
fn build_rustls_config(material: &TlsMaterial) -> Result<rustls::ServerConfig, IngestError> {
    let certs = rustls_pemfile::certs(&mut material.cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IngestError::Config(format!("invalid TLS certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut material.key_pem.as_slice())
        .map_err(|e| IngestError::Config(format!("invalid TLS key: {e}")))?
        .ok_or_else(|| IngestError::Config("TLS key PEM contains no private key".to_string()))?;

    let builder = rustls::ServerConfig::builder();
    let config = match &material.client_ca_pem {
        Some(ca_pem) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                let cert =
                    cert.map_err(|e| IngestError::Config(format!("invalid client CA: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| IngestError::Config(format!("invalid client CA: {e}")))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| IngestError::Config(format!("client CA verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| IngestError::Config(format!("TLS configuration rejected: {e}")))?;

    Ok(config)
}

/* ============================= INGESTOR ============================= */

/// HTTPS listener accepting the apiserver's audit-webhook envelope.
///
/// No position is persisted: on restart the apiserver resends through its
/// retry buffer and the LRU absorbs the overlap.
pub struct WebhookIngestor {
    cfg: WebhookConfig,
    client: Option<Client>,
    namespace: String,
    source: String,
}

impl WebhookIngestor {
    pub fn new(cfg: WebhookConfig, client: Option<Client>, namespace: &str, source: &str) -> Self {
        WebhookIngestor {
            cfg,
            client,
            namespace: namespace.to_string(),
            source: source.to_string(),
        }
    }
}

#[async_trait]
impl Ingestor for WebhookIngestor {
    async fn run(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), IngestError> {
        let material = load_tls_material(&self.cfg, self.client.as_ref(), &self.namespace).await?;
        let rustls_config = build_rustls_config(&material)?;

        let rate_limit = self
            .cfg
            .rate_limit_per_second
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_SECOND);
        let max_body = self
            .cfg
            .max_request_body_bytes
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        let state = Arc::new(ReceiverState::new(tx, rate_limit, &self.source));
        let app = build_router(state, max_body);

        let port = self.cfg.port.unwrap_or(DEFAULT_PORT);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let shutdown_cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_cancel.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        info!(
            source = %self.source,
            addr = %addr,
            mtls = material.client_ca_pem.is_some(),
            "webhook_receiver_started"
        );

        let tls = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;

        if !cancel.is_cancelled() {
            warn!(source = %self.source, "webhook_receiver_stopped_unexpectedly");
        }
        Ok(())
    }

    fn checkpoint(&self) -> Position {
        Position::None
    }
}

/* ============================= TESTS ============================= */

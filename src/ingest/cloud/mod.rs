pub mod parsers;
pub mod pull;

#[cfg(feature = "aws")]
pub mod aws;
#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "gcp")]
pub mod gcp;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::CloudConfig;
use crate::event::AuditEvent;
use crate::ingest::{IngestError, Ingestor, Position};
use crate::metrics;

/* ============================= MESSAGE ============================= */

/// One opaque message pulled off a cloud bus.
#[derive(Debug, Clone, Default)]
pub struct CloudMessage {
    pub partition: String,
    pub sequence: Option<i64>,
    pub enqueued: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
}

/* ============================= CAPABILITIES ============================= */

/// Uniform capability over the provider transports.
///
/// For broker-leased partitions the implementation exclusively owns its
/// lease; a lost lease surfaces as `IngestError::LeaseLost` and the loop
/// relinquishes the partition and waits for the next one.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn connect(&mut self) -> Result<(), IngestError>;

    async fn receive(&mut self) -> Result<Vec<CloudMessage>, IngestError>;

    /// Record acknowledgement after downstream acceptance of the batch.
    async fn acknowledge(&mut self, batch: &[CloudMessage]) -> Result<(), IngestError>;

    async fn close(&mut self) -> Result<(), IngestError>;

    /// A source that tracks its own durable cursor (the pull model)
    /// reports it here; push sources leave it to the ingestor, which
    /// derives an informational partition map instead.
    fn position(&self) -> Option<Position> {
        None
    }
}

/// Extracts zero or more audit events from one message body.
///
/// `Err` means the body itself was unreadable; wrapper records of other
/// categories are skipped, not errors.
pub trait EnvelopeParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<Vec<AuditEvent>, serde_json::Error>;
}

impl std::fmt::Debug for dyn MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn MessageSource")
    }
}

impl std::fmt::Debug for dyn EnvelopeParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn EnvelopeParser")
    }
}

/* ============================= REGISTRY ============================= */

/// Instantiate the adapter pair for the configured provider.
///
/// Adapters are compile-time options: asking for a provider the binary was
/// built without is an explicit configuration error, never silent fallback.
pub fn build_adapter(
    cloud: &CloudConfig,
    resume: &Position,
) -> Result<(Box<dyn MessageSource>, Box<dyn EnvelopeParser>), IngestError> {
    use crate::crd::CloudProvider;

    match cloud.provider {
        CloudProvider::Azure => {
            #[cfg(feature = "azure")]
            {
                let cfg = cloud.azure.as_ref().ok_or_else(|| {
                    IngestError::Config("cloud.azure configuration is required".to_string())
                })?;
                let _ = resume;
                Ok((
                    Box::new(azure::EventHubSource::new(cfg.clone())),
                    Box::new(parsers::AzureEnvelopeParser),
                ))
            }
            #[cfg(not(feature = "azure"))]
            {
                let _ = resume;
                Err(unknown_provider("azure"))
            }
        }
        CloudProvider::Aws => {
            #[cfg(feature = "aws")]
            {
                let cfg = cloud.aws.as_ref().ok_or_else(|| {
                    IngestError::Config("cloud.aws configuration is required".to_string())
                })?;
                Ok((
                    Box::new(aws::log_group_source(cfg.clone(), resume)),
                    Box::new(parsers::AwsEnvelopeParser),
                ))
            }
            #[cfg(not(feature = "aws"))]
            {
                let _ = resume;
                Err(unknown_provider("aws"))
            }
        }
        CloudProvider::Gcp => {
            #[cfg(feature = "gcp")]
            {
                let cfg = cloud.gcp.as_ref().ok_or_else(|| {
                    IngestError::Config("cloud.gcp configuration is required".to_string())
                })?;
                let _ = resume;
                Ok((
                    Box::new(gcp::PubSubSource::new(cfg.clone())),
                    Box::new(parsers::GcpEnvelopeParser),
                ))
            }
            #[cfg(not(feature = "gcp"))]
            {
                let _ = resume;
                Err(unknown_provider("gcp"))
            }
        }
    }
}

#[allow(dead_code)]
fn unknown_provider(name: &str) -> IngestError {
    IngestError::Config(format!(
        "unknown cloud provider {name:?}: this binary was built without the {name:?} feature"
    ))
}

/* ============================= CLUSTER IDENTITY ============================= */

/// Annotation keys an event may carry its origin-cluster identity under.
pub const IDENTITY_ANNOTATION_KEYS: &[&str] =
    &["rbacwatch.io/cluster", "cluster-identity", "cluster-name"];

/// Matches events against the declared cluster identity on shared buses.
///
/// An event carrying an explicit, different identity is rejected; an event
/// carrying none is allowed with a debug log — defense in depth, not a
/// gate.
pub struct ClusterIdentityValidator {
    identity: Option<String>,
}

impl ClusterIdentityValidator {
    pub fn new(identity: Option<String>) -> Self {
        ClusterIdentityValidator { identity }
    }

    pub fn accepts(&self, event: &AuditEvent) -> bool {
        let Some(identity) = &self.identity else {
            return true;
        };
        for key in IDENTITY_ANNOTATION_KEYS {
            if let Some(value) = event.annotations.get(*key) {
                return value == identity;
            }
        }
        if event.request_uri.contains(identity.as_str()) {
            return true;
        }
        debug!(
            audit_id = %event.audit_id,
            identity = %identity,
            "cluster_identity_unmatched_defaulting_to_allow"
        );
        true
    }
}

/* ============================= INGESTOR ============================= */

const RECEIVE_BACKOFF_CAP: Duration = Duration::from_secs(60);
const CLOSE_DEADLINE: Duration = Duration::from_secs(10);

/// Drives one provider adapter: receive, parse, validate, emit, ack.
pub struct CloudIngestor {
    provider: String,
    source: tokio::sync::Mutex<Box<dyn MessageSource>>,
    parser: Box<dyn EnvelopeParser>,
    validator: ClusterIdentityValidator,
    position: Mutex<Position>,
}

impl CloudIngestor {
    pub fn new(
        provider: &str,
        source: Box<dyn MessageSource>,
        parser: Box<dyn EnvelopeParser>,
        validator: ClusterIdentityValidator,
        resume: Position,
    ) -> Self {
        CloudIngestor {
            provider: provider.to_string(),
            source: tokio::sync::Mutex::new(source),
            parser,
            validator,
            position: Mutex::new(resume),
        }
    }

    fn record_position(&self, source: &dyn MessageSource, batch: &[CloudMessage]) {
        let mut position = self.position.lock().expect("position lock poisoned");
        if let Some(pos) = source.position() {
            *position = pos;
            return;
        }
        let (mut partitions, mut last_timestamp) = match &*position {
            Position::Cloud { partitions, last_timestamp } => {
                (partitions.clone(), *last_timestamp)
            }
            _ => (BTreeMap::new(), None),
        };
        for message in batch {
            if let Some(sequence) = message.sequence {
                partitions.insert(message.partition.clone(), sequence);
            }
            if let Some(enqueued) = message.enqueued
                && last_timestamp.is_none_or(|t| enqueued > t)
            {
                last_timestamp = Some(enqueued);
            }
        }
        *position = Position::Cloud { partitions, last_timestamp };
    }

    async fn emit_batch(
        &self,
        batch: &[CloudMessage],
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AuditEvent>,
    ) -> Result<(), IngestError> {
        let now = Utc::now();
        for message in batch {
            metrics::CLOUD_MESSAGES_RECEIVED
                .with_label_values(&[&self.provider, &message.partition])
                .inc();
            if let Some(enqueued) = message.enqueued {
                let lag = (now - enqueued).num_milliseconds().max(0) as f64 / 1000.0;
                metrics::CLOUD_LAG_SECONDS
                    .with_label_values(&[&self.provider])
                    .observe(lag);
            }

            let events = match self.parser.parse(&message.body) {
                Ok(events) => events,
                Err(e) => {
                    metrics::CLOUD_PARSE_ERRORS
                        .with_label_values(&[&self.provider])
                        .inc();
                    warn!(
                        provider = %self.provider,
                        partition = %message.partition,
                        error = %e,
                        "cloud_envelope_unparseable"
                    );
                    continue;
                }
            };

            for event in events {
                if !self.validator.accepts(&event) {
                    metrics::CLOUD_IDENTITY_REJECTED
                        .with_label_values(&[&self.provider])
                        .inc();
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(IngestError::Shutdown),
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return Err(IngestError::Shutdown);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Ingestor for CloudIngestor {
    async fn run(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), IngestError> {
        let mut source = self.source.lock().await;
        source.connect().await?;
        info!(provider = %self.provider, "cloud_ingestor_connected");

        let mut consecutive_errors: u32 = 0;
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                received = source.receive() => match received {
                    Ok(batch) => {
                        consecutive_errors = 0;
                        batch
                    }
                    Err(IngestError::LeaseLost(partition)) => {
                        // Relinquish and wait for the next lease.
                        info!(provider = %self.provider, partition = %partition, "partition_lease_lost");
                        continue;
                    }
                    Err(e) if e.is_shutdown() => break,
                    Err(e) => {
                        metrics::CLOUD_RECEIVE_ERRORS
                            .with_label_values(&[&self.provider])
                            .inc();
                        consecutive_errors += 1;
                        let delay = Duration::from_secs(1 << consecutive_errors.min(6))
                            .min(RECEIVE_BACKOFF_CAP);
                        warn!(provider = %self.provider, error = %e, ?delay, "cloud_receive_failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };

            if batch.is_empty() {
                continue;
            }

            match self.emit_batch(&batch, &cancel, &tx).await {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            }

            if let Err(e) = source.acknowledge(&batch).await {
                metrics::CLOUD_RECEIVE_ERRORS
                    .with_label_values(&[&self.provider])
                    .inc();
                warn!(provider = %self.provider, error = %e, "cloud_acknowledge_failed");
            } else {
                metrics::CLOUD_MESSAGES_ACKED
                    .with_label_values(&[&self.provider])
                    .inc_by(batch.len() as u64);
            }

            self.record_position(source.as_ref(), &batch);
        }

        if tokio::time::timeout(CLOSE_DEADLINE, source.close()).await.is_err() {
            warn!(provider = %self.provider, "cloud_source_close_timed_out");
        }
        Ok(())
    }

    fn checkpoint(&self) -> Position {
        self.position.lock().expect("position lock poisoned").clone()
    }
}

/* ============================= TESTS ============================= */

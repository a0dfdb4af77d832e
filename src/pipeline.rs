use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::RuleAggregator;
use crate::crd::{
    AuditSource, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_SECONDS,
    DEFAULT_MAX_RULES_PER_REPORT, DEFAULT_RETENTION_DAYS, PHASE_RUNNING, PolicyStrategy,
    SourceType,
};
use crate::event::AuditEvent;
use crate::filter::FilterChain;
use crate::ingest::cloud::{CloudIngestor, ClusterIdentityValidator, build_adapter};
use crate::ingest::file::FileTailIngestor;
use crate::ingest::webhook::WebhookIngestor;
use crate::ingest::{CHANNEL_CAPACITY, IngestError, Ingestor, Position};
use crate::metrics;
use crate::report;
use crate::resolver;
use crate::rule;
use crate::scorer;
use crate::strategy;
use crate::subject;

/// Grace period for the final flush and for ingestor teardown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const PERSIST_ATTEMPTS: usize = 3;

/* ============================= CONFIG ============================= */

#[derive(Clone)]
pub struct PipelineConfig {
    pub source_name: String,
    pub flush_interval: Duration,
    pub batch_size: u64,
    pub retention: chrono::Duration,
    pub max_rules_per_report: usize,
    pub strategy: PolicyStrategy,
    pub sensitive: BTreeSet<String>,
    pub ignore_system_users: bool,
}

impl PipelineConfig {
    pub fn from_source(source: &AuditSource) -> Self {
        let spec = &source.spec;
        let interval = spec
            .checkpoint
            .as_ref()
            .and_then(|c| c.interval_seconds)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECONDS);
        let batch_size = spec
            .checkpoint
            .as_ref()
            .and_then(|c| c.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let retention_days = spec
            .limits
            .as_ref()
            .and_then(|l| l.retention_days)
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        let max_rules = spec
            .limits
            .as_ref()
            .and_then(|l| l.max_rules_per_report)
            .unwrap_or(DEFAULT_MAX_RULES_PER_REPORT);

        let mut sensitive = scorer::default_sensitive_set();
        if let Some(extra) = &spec.sensitive_resources {
            sensitive.extend(extra.iter().cloned());
        }

        PipelineConfig {
            source_name: source.name_any(),
            flush_interval: Duration::from_secs(interval.max(1)),
            batch_size: batch_size.max(1),
            retention: chrono::Duration::days(retention_days.max(1)),
            max_rules_per_report: max_rules,
            strategy: spec.policy_strategy.unwrap_or_default(),
            sensitive,
            ignore_system_users: spec.ignore_system_users.unwrap_or(true),
        }
    }
}

/* ============================= INGESTOR SELECTION ============================= */

/// Instantiate the ingestor variant the source declares. Missing
/// adapter-specific configuration is a startup fault.
pub fn build_ingestor(
    source: &AuditSource,
    resume: &Position,
    client: Option<Client>,
) -> Result<Arc<dyn Ingestor>, IngestError> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_else(|| "default".to_string());
    let spec = &source.spec;

    match spec.source_type {
        SourceType::File => {
            let location = spec.location.as_ref().ok_or_else(|| {
                IngestError::Config("sourceType File requires location.path".to_string())
            })?;
            Ok(Arc::new(FileTailIngestor::new(
                &location.path,
                location.poll_interval_ms,
                resume,
                &name,
            )))
        }
        SourceType::Webhook => {
            let cfg = spec.webhook.clone().ok_or_else(|| {
                IngestError::Config("sourceType Webhook requires webhook configuration".to_string())
            })?;
            Ok(Arc::new(WebhookIngestor::new(cfg, client, &namespace, &name)))
        }
        SourceType::Cloud => {
            let cloud = spec.cloud.as_ref().ok_or_else(|| {
                IngestError::Config("sourceType Cloud requires cloud configuration".to_string())
            })?;
            let (message_source, parser) = build_adapter(cloud, resume)?;
            let validator = ClusterIdentityValidator::new(cloud.cluster_identity.clone());
            Ok(Arc::new(CloudIngestor::new(
                &cloud.provider.to_string(),
                message_source,
                parser,
                validator,
                resume.clone(),
            )))
        }
    }
}

/* ============================= CONSUMER ============================= */

#[derive(Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Aggregated,
    FilteredOut,
    Skipped,
}

/// Run one event through filter → normalize → aggregate.
///
/// Chronological delivery is a precondition at this boundary: events must
/// arrive in source order, which each ingestor preserves within itself.
pub fn process_event(
    event: &AuditEvent,
    chain: &FilterChain,
    ignore_system_users: bool,
    aggregator: &RuleAggregator,
) -> EventOutcome {
    if !event.is_aggregatable_stage() {
        return EventOutcome::Skipped;
    }

    let username = &event.user.username;
    let namespace = event
        .object_ref
        .as_ref()
        .map(|o| o.namespace.as_str())
        .unwrap_or_default();

    if !chain.allows(username, namespace) {
        return EventOutcome::FilteredOut;
    }

    let Some(subject) = subject::normalize_username(username, ignore_system_users) else {
        return EventOutcome::FilteredOut;
    };
    let Some(canonical) = rule::normalize_event(event) else {
        return EventOutcome::Skipped;
    };

    let timestamp = event.timestamp().unwrap_or_else(Utc::now);
    aggregator.add(subject, canonical, timestamp);
    EventOutcome::Aggregated
}

async fn consume(
    mut rx: mpsc::Receiver<AuditEvent>,
    chain: FilterChain,
    config: PipelineConfig,
    aggregator: Arc<RuleAggregator>,
    flush_now: Arc<Notify>,
) {
    let mut since_flush_signal: u64 = 0;
    while let Some(event) = rx.recv().await {
        match process_event(&event, &chain, config.ignore_system_users, &aggregator) {
            EventOutcome::Aggregated => {
                metrics::EVENTS_INGESTED
                    .with_label_values(&[&config.source_name])
                    .inc();
                since_flush_signal += 1;
                if since_flush_signal >= config.batch_size {
                    since_flush_signal = 0;
                    flush_now.notify_one();
                }
            }
            EventOutcome::FilteredOut => {
                metrics::EVENTS_FILTERED
                    .with_label_values(&[&config.source_name])
                    .inc();
            }
            EventOutcome::Skipped => {}
        }
    }
}

/* ============================= FLUSH ============================= */

async fn flush_cycle(
    client: &Client,
    source: &AuditSource,
    config: &PipelineConfig,
    aggregator: &RuleAggregator,
    ingestor: &dyn Ingestor,
) -> Result<()> {
    let _timer = metrics::FLUSH_DURATION.start_timer();

    let cutoff = Utc::now() - config.retention;
    let pruned = aggregator.prune_older_than(cutoff);
    if pruned > 0 {
        metrics::RULES_PRUNED
            .with_label_values(&[&config.source_name])
            .inc_by(pruned as u64);
        debug!(source = %config.source_name, pruned, "retention_pruned_rules");
    }

    let snapshot = aggregator.snapshot();
    let subject_count = snapshot.len();
    let live_reports: std::collections::HashSet<String> = snapshot
        .keys()
        .map(|subject| report::report_name(&config.source_name, subject))
        .collect();

    for (subject, mut rules) in snapshot {
        let evicted = report::cap_rules(&mut rules, config.max_rules_per_report);
        if evicted > 0 {
            debug!(
                source = %config.source_name,
                subject = %subject,
                evicted,
                "report_rule_cap_applied"
            );
        }

        let granted = match resolver::resolve_effective(client, &subject).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(subject = %subject, error = %e, "effective_permission_resolution_failed");
                continue;
            }
        };

        let compliance = scorer::score_subject(&rules, &granted, &config.sensitive);
        let manifests =
            strategy::render_manifests(&config.source_name, &subject, &rules, &config.strategy);
        let status = report::build_status(&rules, manifests, &compliance);

        if let Err(e) = report::upsert_report(client, source, &subject, status).await {
            warn!(subject = %subject, error = %e, "policy_report_upsert_failed");
        }
    }

    if pruned > 0
        && let Err(e) = report::delete_stale_reports(client, source, &live_reports).await
    {
        warn!(source = %config.source_name, error = %e, "stale_report_sweep_failed");
    }

    persist_position(
        client,
        source,
        ingestor.checkpoint(),
        aggregator.events_seen(),
        subject_count as u32,
    )
    .await;

    metrics::FLUSH_TOTAL
        .with_label_values(&[&config.source_name])
        .inc();
    Ok(())
}

/// Persist the position into the source status with a bounded
/// read-modify-write loop. Exhausted retries leave the position advanced
/// in memory; the next flush tries again.
async fn persist_position(
    client: &Client,
    source: &AuditSource,
    checkpoint: Position,
    events_aggregated: u64,
    subjects_observed: u32,
) {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<AuditSource> = Api::namespaced(client.clone(), &namespace);

    for attempt in 1..=PERSIST_ATTEMPTS {
        let mut current = match api.get(&name).await {
            Ok(current) => current,
            Err(e) => {
                warn!(source = %name, error = %e, "source_read_failed_before_checkpoint");
                return;
            }
        };

        let mut status = current.status.clone().unwrap_or_default();
        status.phase = Some(PHASE_RUNNING.to_string());
        status.message = None;
        status.observed_generation = current.metadata.generation;
        status.position = checkpoint.to_status();
        status.last_checkpoint_time = Some(Utc::now().to_rfc3339());
        status.events_aggregated = Some(events_aggregated);
        status.subjects_observed = Some(subjects_observed);
        current.status = Some(status);

        let payload = match serde_json::to_vec(&current) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(source = %name, error = %e, "source_status_serialization_failed");
                return;
            }
        };

        match api.replace_status(&name, &PostParams::default(), payload).await {
            Ok(_) => return,
            Err(kube::Error::Api(e)) if e.code == 409 => {
                metrics::POSITION_CONFLICTS.inc();
                debug!(source = %name, attempt, "checkpoint_write_conflict");
            }
            Err(e) => {
                warn!(source = %name, error = %e, "checkpoint_write_failed");
                return;
            }
        }
    }
    warn!(source = %name, "checkpoint_retries_exhausted_position_kept_in_memory");
}

/* ============================= PIPELINE ============================= */

/// Drive one source's pipeline until cancelled or fatally failed.
///
/// The ingestor runs on its own task feeding a bounded channel; a single
/// consumer preserves intra-source order through filter → normalize →
/// aggregate; this task owns the flush cadence.
pub async fn run_pipeline(
    client: Client,
    source: Arc<AuditSource>,
    cancel: CancellationToken,
    flush_semaphore: Arc<Semaphore>,
) -> Result<()> {
    let config = PipelineConfig::from_source(&source);
    let spec = &source.spec;

    let chain = FilterChain::compile(
        spec.filters.as_deref().unwrap_or(&[]),
        config.ignore_system_users,
    )
    .map_err(|e| anyhow!("filter chain rejected: {e}"))?;

    let resume = Position::from_status(source.status.as_ref().and_then(|s| s.position.as_ref()));
    let ingestor = build_ingestor(&source, &resume, Some(client.clone()))
        .map_err(|e| anyhow!("ingestor startup failed: {e}"))?;

    let aggregator = Arc::new(RuleAggregator::new());
    let flush_now = Arc::new(Notify::new());
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    info!(
        source = %config.source_name,
        resumed = ?resume,
        "pipeline_started"
    );
    metrics::PIPELINES_RUNNING.inc();

    let mut ingest_task = {
        let ingestor = ingestor.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { ingestor.run(cancel, tx).await })
    };
    let consumer_task = tokio::spawn(consume(
        rx,
        chain,
        config.clone(),
        aggregator.clone(),
        flush_now.clone(),
    ));

    let mut interval = tokio::time::interval(config.flush_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // the first tick fires immediately

    let mut pipeline_error: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = flush_now.notified() => {}
            joined = &mut ingest_task => {
                match joined {
                    Ok(Ok(())) => info!(source = %config.source_name, "ingestor_finished"),
                    Ok(Err(e)) if e.is_shutdown() => {}
                    Ok(Err(e)) => pipeline_error = Some(anyhow!("ingestor failed: {e}")),
                    Err(e) => pipeline_error = Some(anyhow!("ingestor task panicked: {e}")),
                }
                // Replace the handle with a task that never completes so the
                // select loop can keep flushing until cancellation.
                ingest_task =
                    tokio::spawn(async { futures::future::pending::<Result<(), IngestError>>().await });
                if pipeline_error.is_some() {
                    break;
                }
            }
        }

        let _permit = flush_semaphore.acquire().await.context("flush semaphore closed")?;
        if let Err(e) = flush_cycle(&client, &source, &config, &aggregator, ingestor.as_ref()).await
        {
            metrics::FLUSH_ERRORS
                .with_label_values(&[&config.source_name])
                .inc();
            warn!(source = %config.source_name, error = %e, "flush_cycle_failed");
        }
    }

    // Final flush, best effort within the shutdown grace.
    let final_flush = flush_cycle(&client, &source, &config, &aggregator, ingestor.as_ref());
    match tokio::time::timeout(SHUTDOWN_GRACE, final_flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(source = %config.source_name, error = %e, "final_flush_failed"),
        Err(_) => warn!(source = %config.source_name, "final_flush_abandoned_on_deadline"),
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, &mut ingest_task).await.is_err() {
        warn!(source = %config.source_name, "ingestor_close_deadline_exceeded");
        ingest_task.abort();
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, consumer_task).await;

    metrics::PIPELINES_RUNNING.dec();
    info!(source = %config.source_name, "pipeline_stopped");

    match pipeline_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/* ============================= TESTS ============================= */

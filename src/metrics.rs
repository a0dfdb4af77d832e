use std::sync::LazyLock;

use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

/* ============================= REGISTRY ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub fn registry() -> &'static Registry {
    &REGISTRY
}

/* ============================= PIPELINE ============================= */

pub static EVENTS_INGESTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_events_ingested_total",
            "Audit events emitted by ingestors, per source",
        ),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static EVENTS_FILTERED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_events_filtered_total",
            "Audit events dropped by the filter chain, per source",
        ),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static PARSE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_parse_errors_total",
            "Malformed audit payloads dropped, per source",
        ),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static PIPELINES_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("rbacwatch_pipelines_running", "Pipelines currently running")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static FLUSH_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("rbacwatch_flush_total", "Flush cycles completed, per source"),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static FLUSH_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("rbacwatch_flush_errors_total", "Flush cycles that failed, per source"),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static FLUSH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "rbacwatch_flush_duration_seconds",
        "Duration of one flush cycle in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static REPORTS_UPSERTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_reports_upserted_total",
            "PolicyReport create/update operations, per source",
        ),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RULES_PRUNED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_rules_pruned_total",
            "Observed rules dropped by retention, per source",
        ),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static POSITION_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rbacwatch_position_persist_conflicts_total",
        "Optimistic-concurrency conflicts while persisting positions",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= WEBHOOK ============================= */

pub static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_webhook_requests_total",
            "Webhook receiver requests by source and status code",
        ),
        &["source", "code"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static WEBHOOK_DEDUP_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_webhook_dedup_dropped_total",
            "Duplicate audit IDs absorbed by the webhook LRU, per source",
        ),
        &["source"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= CLOUD ============================= */

pub static CLOUD_MESSAGES_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_cloud_messages_received_total",
            "Messages received from the bus, per provider and partition",
        ),
        &["provider", "partition"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLOUD_MESSAGES_ACKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_cloud_messages_acked_total",
            "Messages acknowledged on the bus, per provider",
        ),
        &["provider"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLOUD_RECEIVE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_cloud_receive_errors_total",
            "Receive failures on the bus, per provider",
        ),
        &["provider"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLOUD_PARSE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_cloud_parse_errors_total",
            "Messages dropped for unparseable envelopes, per provider",
        ),
        &["provider"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLOUD_IDENTITY_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rbacwatch_cloud_identity_rejected_total",
            "Events rejected for carrying a foreign cluster identity, per provider",
        ),
        &["provider"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLOUD_LAG_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "rbacwatch_cloud_lag_seconds",
            "Delay from bus enqueue time to pipeline processing, per provider",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["provider"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/* ============================= EXPOSITION ============================= */

/// Force-init every metric so it appears on /metrics before first use.
pub fn force_init() {
    LazyLock::force(&EVENTS_INGESTED);
    LazyLock::force(&EVENTS_FILTERED);
    LazyLock::force(&PARSE_ERRORS);
    LazyLock::force(&PIPELINES_RUNNING);
    LazyLock::force(&FLUSH_TOTAL);
    LazyLock::force(&FLUSH_ERRORS);
    LazyLock::force(&FLUSH_DURATION);
    LazyLock::force(&REPORTS_UPSERTED);
    LazyLock::force(&RULES_PRUNED);
    LazyLock::force(&POSITION_CONFLICTS);
    LazyLock::force(&WEBHOOK_REQUESTS);
    LazyLock::force(&WEBHOOK_DEDUP_DROPPED);
    LazyLock::force(&CLOUD_MESSAGES_RECEIVED);
    LazyLock::force(&CLOUD_MESSAGES_ACKED);
    LazyLock::force(&CLOUD_RECEIVE_ERRORS);
    LazyLock::force(&CLOUD_PARSE_ERRORS);
    LazyLock::force(&CLOUD_IDENTITY_REJECTED);
    LazyLock::force(&CLOUD_LAG_SECONDS);
}

/// Encode the registry in Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/* ============================= TESTS ============================= */

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SOURCE TYPES ============================= */

/// Transport variant an AuditSource reads events from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    File,
    Webhook,
    Cloud,
}

/// File-tail ingestor input.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    /// Path of the audit log file (one JSON event per line).
    pub path: String,

    /// Poll interval between read cycles, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

/// Webhook receiver parameters.
///
/// TLS is mandatory; a client-CA reference switches on mTLS verification.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Name of a kubernetes.io/tls secret holding the server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    /// Filesystem override for the server certificate (takes precedence).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<String>,

    /// Secret whose `ca.crt` enables client-certificate verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_second: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_body_bytes: Option<usize>,
}

/// Cloud message-bus provider selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Azure,
    Aws,
    Gcp,
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudProvider::Azure => write!(f, "azure"),
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Gcp => write!(f, "gcp"),
        }
    }
}

/// Event Hub consumed through its Kafka-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AzureEventHubConfig {
    pub bootstrap_servers: String,
    pub event_hub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_group: Option<String>,

    /// Environment variable holding the Event Hub connection string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string_env: Option<String>,
}

/// CloudWatch log group polled by timestamp cursor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AwsLogGroupConfig {
    pub log_group: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<u64>,

    /// How far back to start when no position has been persisted yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_minutes: Option<i64>,
}

/// Pub/Sub subscription with broker-managed acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GcpPubSubConfig {
    pub project_id: String,
    pub subscription: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    pub provider: CloudProvider,

    /// Identifier distinguishing this cluster's events on a shared bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_identity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureEventHubConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsLogGroupConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpPubSubConfig>,
}

/* ============================= FILTER TYPES ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Deny,
}

/// One entry of the ordered filter chain.
///
/// Patterns combine disjunctively: a rule matches when either pattern does.
/// A rule with neither pattern set matches nothing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    pub action: FilterAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_pattern: Option<String>,
}

/* ============================= STRATEGY TYPES ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ScopeMode {
    #[default]
    NamespaceStrict,
    ClusterScopeAllowed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VerbMerge {
    #[default]
    Smart,
    Exact,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum WildcardPolicy {
    #[default]
    Forbidden,
    Safe,
}

/// The three axes governing manifest rendering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_mode: Option<ScopeMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb_merge: Option<VerbMerge>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcards: Option<WildcardPolicy>,
}

impl PolicyStrategy {
    pub fn scope_mode(&self) -> ScopeMode {
        self.scope_mode.unwrap_or_default()
    }

    pub fn verb_merge(&self) -> VerbMerge {
        self.verb_merge.unwrap_or_default()
    }

    pub fn wildcards(&self) -> WildcardPolicy {
        self.wildcards.unwrap_or_default()
    }
}

/* ============================= CADENCE & LIMITS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Seconds between flush cycles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,

    /// Aggregated-event count that forces an early flush.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rules_per_report: Option<usize>,

    /// Observed rules idle longer than this are pruned at flush time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i64>,
}

pub const DEFAULT_FLUSH_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_MAX_RULES_PER_REPORT: usize = 300;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/* ============================= AUDIT SOURCE ============================= */

/// AuditSource declares one audit-event stream to observe.
///
/// Each source drives one pipeline instance; the persisted position in the
/// status lets a restarted pipeline resume where it left off.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "rbacwatch.io",
    version = "v1alpha1",
    kind = "AuditSource",
    plural = "auditsources",
    status = "AuditSourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AuditSourceSpec {
    pub source_type: SourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<FileLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,

    /// Ordered allow/deny chain; first match decides, default Allow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<FilterRule>>,

    /// Drop `system:` principals (service accounts always retained).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_system_users: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_strategy: Option<PolicyStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    /// Extra resource names treated as sensitive in compliance scoring,
    /// on top of the built-in high-risk set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitive_resources: Option<Vec<String>>,
}

/// Serialized ingestor position, persisted on each checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PositionStatus {
    /// Byte offset into the tailed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    /// Inode of the tailed file, for rotation detection across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,

    /// Per-partition sequence numbers for broker-backed sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<BTreeMap<String, i64>>,

    /// Upper bound of fully-consumed event time for pull-based sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuditSourceStatus {
    /// Running or Degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_aggregated: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjects_observed: Option<u32>,
}

pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_DEGRADED: &str = "Degraded";

/* ============================= POLICY REPORT ============================= */

/// The subject a report describes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    /// ServiceAccount, User, or Group.
    pub kind: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One aggregated rule as published on a report.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObservedRuleStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_groups: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_resource_urls: Vec<String>,

    pub verbs: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub first_seen: String,
    pub last_seen: String,
    pub count: u64,
}

/// A single expanded permission, used in the excess list.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleAtomStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,

    pub resource: String,
    pub verb: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum SeverityBand {
    Green,
    Yellow,
    #[default]
    Red,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceStatus {
    /// Needed / granted, as an integer percentage.
    pub score: u32,

    pub severity: SeverityBand,

    pub needed: u32,
    pub excess: u32,
    pub ungranted: u32,

    /// Granted-but-unused permissions, expanded to atoms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excess_atoms: Vec<RuleAtomStatus>,

    /// Whether any excess permission touches a sensitive resource.
    pub sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedPolicy {
    /// Rendered authorization-object manifests, ready to apply.
    pub manifests: Vec<String>,
}

/// PolicyReport publishes the inferred least-privilege policy and the
/// compliance assessment for one observed subject.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "rbacwatch.io",
    version = "v1alpha1",
    kind = "PolicyReport",
    plural = "policyreports",
    status = "PolicyReportStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReportSpec {
    /// Name of the AuditSource this report was derived from.
    pub source_name: String,

    pub subject: SubjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_rules: Vec<ObservedRuleStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_policy: Option<SuggestedPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceStatus>,

    /// Total audit events aggregated into this report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_events: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/* ============================= TESTS ============================= */
